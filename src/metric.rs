use opentelemetry::{KeyValue, metrics::UpDownCounter};
use std::sync::LazyLock;

static STATDS: LazyLock<UpDownCounter<i64>> = LazyLock::new(|| {
    logfire::i64_up_down_counter("hook_relay_statds")
        .with_description("Webhook relay statistics")
        .with_unit("message")
        .build()
});

fn incr_statds(metric: &'static str, value: &str) {
    STATDS.add(1, &[KeyValue::new(metric, value.to_string())]);
}

pub fn incr_enqueue_decision_statds(decision: &str) {
    incr_statds("enqueue_decision", decision)
}

pub fn incr_delivery_outcome_statds(outcome: &str) {
    incr_statds("delivery_outcome", outcome)
}

pub fn incr_worker_tick_statds(status: &str) {
    incr_statds("worker_tick", status)
}
