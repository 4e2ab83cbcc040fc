// ABOUTME: Reply agent invocation seam with a subprocess-backed implementation
// ABOUTME: Ships a scriptable mock invoker used by trigger and hub tests

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;

use crate::config::AgentConfig;

/// Produces a reply for a rendered conversation transcript. Returning
/// `Ok(None)` means the agent declined to reply.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, conversation: &str) -> Result<Option<String>>;
}

/// Spawns the configured agent binary once per invocation and feeds it
/// the conversation on stdin. The agent's stdout is the reply.
pub struct ProcessInvoker {
    config: AgentConfig,
}

impl ProcessInvoker {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AgentInvoker for ProcessInvoker {
    async fn invoke(&self, conversation: &str) -> Result<Option<String>> {
        let mut cmd = tokio::process::Command::new(&self.config.binary);
        cmd.arg("system")
            .arg("event")
            .arg("--mode")
            .arg("now")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(url) = &self.config.gateway_url {
            cmd.arg("--gateway-url").arg(url);
        }
        if let Some(token) = &self.config.gateway_token {
            cmd.arg("--gateway-token").arg(token);
        }

        tracing::debug!(binary = %self.config.binary, "Invoking reply agent");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn agent binary {}", self.config.binary))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(conversation.as_bytes())
                .await
                .context("Failed to write conversation to agent")?;
            // Closes stdin so the agent sees EOF
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for agent")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Agent exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        let reply = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if reply.is_empty() || reply == "ok" {
            return Ok(None);
        }
        Ok(Some(reply))
    }
}

/// Test invoker that pops scripted replies and records every transcript
/// it was asked about.
#[derive(Default)]
pub struct MockInvoker {
    replies: std::sync::Mutex<std::collections::VecDeque<Option<String>>>,
    calls: std::sync::Mutex<Vec<String>>,
    delay: Option<std::time::Duration>,
}

impl MockInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: std::time::Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn push_reply(&self, reply: Option<&str>) {
        self.replies
            .lock()
            .unwrap()
            .push_back(reply.map(|s| s.to_string()));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl AgentInvoker for MockInvoker {
    async fn invoke(&self, conversation: &str) -> Result<Option<String>> {
        self.calls.lock().unwrap().push(conversation.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.replies.lock().unwrap().pop_front();
        match scripted {
            Some(reply) => Ok(reply),
            None => Ok(Some("mock reply".to_string())),
        }
    }
}
