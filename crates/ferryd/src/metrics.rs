//! Process-wide gauges mirroring the scheduler's accounting. The
//! scheduler itself owns the authoritative counters; these exist so
//! an operator can chart them.

use prometheus::{IntCounter, IntGauge};
use std::sync::LazyLock;

pub static MESSAGE_COUNT: LazyLock<IntGauge> = LazyLock::new(|| {
    prometheus::register_int_gauge!(
        "scheduler_message_count",
        "number of messages resident in the scheduler"
    )
    .unwrap()
});

pub static RECIPIENT_COUNT: LazyLock<IntGauge> = LazyLock::new(|| {
    prometheus::register_int_gauge!(
        "scheduler_recipient_count",
        "number of in-core recipients across all resident messages"
    )
    .unwrap()
});

pub static DEST_QUEUE_COUNT: LazyLock<IntGauge> = LazyLock::new(|| {
    prometheus::register_int_gauge!(
        "scheduler_dest_queue_count",
        "number of in-core destination queues"
    )
    .unwrap()
});

pub static INFLIGHT_DELIVERIES: LazyLock<IntGauge> = LazyLock::new(|| {
    prometheus::register_int_gauge!(
        "scheduler_inflight_deliveries",
        "entries currently dispatched to delivery workers"
    )
    .unwrap()
});

pub static DISPATCH_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "scheduler_dispatch_total",
        "total entries handed to delivery workers"
    )
    .unwrap()
});

pub static THROTTLE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "scheduler_throttle_total",
        "total destination throttle events"
    )
    .unwrap()
});
