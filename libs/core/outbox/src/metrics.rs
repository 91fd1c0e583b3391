use metrics::{counter, histogram};
use std::time::Duration;

pub(crate) fn message_forwarded(topic: &str) {
    counter!("outbox_messages_forwarded_total", "topic" => topic.to_string()).increment(1);
}

pub(crate) fn publish_failed(topic: &str, gave_up: bool) {
    counter!(
        "outbox_publish_failures_total",
        "topic" => topic.to_string(),
        "final" => if gave_up { "true" } else { "false" }
    )
    .increment(1);
}

pub(crate) fn forward_cycle(duration: Duration, selected: usize) {
    histogram!("outbox_forward_cycle_seconds").record(duration.as_secs_f64());
    histogram!("outbox_forward_batch_size").record(selected as f64);
}
