// ABOUTME: Root library module exposing the relay hub core components
// ABOUTME: Provides access to the store, transport, fan-out, and trigger modules

pub mod agent;
pub mod broker;
pub mod config;
pub mod fanout;
pub mod gateway;
pub mod hub;
pub mod message;
pub mod metrics;
pub mod pidlock;
pub mod store;
pub mod transport;
pub mod trigger;

pub use config::Config;
pub use hub::{HubStatus, IncomingMessage, RelayHub};
pub use message::{Message, MessageKind, MessageSource};
pub use store::MessageStore;
pub use transport::{ResilientTransport, TransportStatus};
