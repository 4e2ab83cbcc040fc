// ABOUTME: Thin wrappers over the metrics facade for hub instrumentation
// ABOUTME: An exporter, if any, is wired up by the embedding process

pub fn messages_ingested() {
    metrics::counter!("chathub_messages_ingested_total").increment(1);
}

pub fn messages_deduplicated() {
    metrics::counter!("chathub_messages_deduplicated_total").increment(1);
}

pub fn publish_ok() {
    metrics::counter!("chathub_publish_total").increment(1);
}

pub fn queue_dropped() {
    metrics::counter!("chathub_queue_dropped_total").increment(1);
}

pub fn queue_depth(depth: usize) {
    metrics::gauge!("chathub_offline_queue_depth").set(depth as f64);
}

pub fn clients_online(count: usize) {
    metrics::gauge!("chathub_clients_online").set(count as f64);
}

pub fn conversations_active(count: usize) {
    metrics::gauge!("chathub_conversations_active").set(count as f64);
}

pub fn trigger_dispatched() {
    metrics::counter!("chathub_trigger_dispatched_total").increment(1);
}

pub fn trigger_timeout() {
    metrics::counter!("chathub_trigger_timeout_total").increment(1);
}

pub fn replies_forwarded() {
    metrics::counter!("chathub_replies_forwarded_total").increment(1);
}
