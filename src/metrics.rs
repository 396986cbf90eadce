//! Prometheus metrics exposed at `/metrics`. Registered once, process-wide,
//! and updated in place by the components that own the numbers.

use prometheus::{Gauge, Histogram, IntGauge, TextEncoder, register_gauge, register_histogram, register_int_gauge};
use std::sync::LazyLock;

/// The number of nodes the health monitor currently considers healthy.
pub static HEALTHY_NODE_COUNT: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("ramd_healthy_node_count", "Number of cluster nodes currently healthy.").unwrap()
});

/// The `node_id` of the node currently believed to be primary, or -1 if none.
pub static CURRENT_PRIMARY_ID: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("ramd_current_primary_id", "node_id of the current primary, or -1 if unknown.").unwrap()
});

/// The failover state machine's current state as a small numeric enum:
/// 0=Normal 1=Detecting 2=Promoting 3=Recovering 4=Completed 5=Failed.
pub static FAILOVER_STATE: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("ramd_failover_state", "Current failover state as a numeric enum.").unwrap()
});

/// Wall-clock duration of completed failovers, from Detecting to Completed.
pub static FAILOVER_DURATION_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "ramd_failover_duration_seconds",
        "Time from failure detection to completed promotion, in seconds."
    )
    .unwrap()
});

/// The number of standbys currently in the synchronous set.
pub static SYNC_STANDBY_COUNT: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("ramd_sync_standby_count", "Number of standbys currently synchronous.").unwrap()
});

/// Cumulative count of failovers by terminal outcome (completed vs failed).
pub static FAILOVERS_COMPLETED_TOTAL: LazyLock<Gauge> = LazyLock::new(|| {
    register_gauge!("ramd_failovers_completed_total", "Total failovers that reached Completed.").unwrap()
});
pub static FAILOVERS_FAILED_TOTAL: LazyLock<Gauge> = LazyLock::new(|| {
    register_gauge!("ramd_failovers_failed_total", "Total failovers that reached Failed.").unwrap()
});

pub fn failover_state_code(state: crate::failover::FailoverState) -> i64 {
    use crate::failover::FailoverState::*;
    match state {
        Normal => 0,
        Detecting => 1,
        Promoting => 2,
        Recovering => 3,
        Completed => 4,
        Failed => 5,
    }
}

/// Gathers all registered metrics and encodes them in the Prometheus text
/// exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_includes_registered_metric_names() {
        HEALTHY_NODE_COUNT.set(3);
        let text = gather();
        assert!(text.contains("ramd_healthy_node_count"));
    }

    #[test]
    fn failover_state_code_is_stable() {
        assert_eq!(failover_state_code(crate::failover::FailoverState::Normal), 0);
        assert_eq!(failover_state_code(crate::failover::FailoverState::Failed), 5);
    }
}
