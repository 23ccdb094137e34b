use std::time::Duration;

/// Engine-wide tuning knobs. Bins build this from CLI flags; tests
/// shrink the windows to keep runs fast.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between assignment-pipeline ticks.
    pub assign_interval: Duration,
    /// Interval between reconciliation passes.
    pub reconcile_interval: Duration,
    /// A durable record younger than this is never reconciled (it may be
    /// racing an in-flight worker report).
    pub grace_window: Duration,
    /// How long after assignment a worker may stay silent before the task
    /// counts as stalled (no transfer start observed).
    pub transfer_start_window: Duration,
    /// System-wide ceiling on per-process execution timeouts.
    pub timeout_ceiling: Duration,
    /// Capacity of each per-instance work queue.
    pub instance_queue_capacity: usize,
    /// How many times a failed event delivery is retried before the event
    /// is logged as lost.
    pub event_redelivery_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            assign_interval: Duration::from_secs(2),
            reconcile_interval: Duration::from_secs(10),
            grace_window: Duration::from_secs(10),
            transfer_start_window: Duration::from_secs(60),
            timeout_ceiling: Duration::from_secs(4 * 3600),
            instance_queue_capacity: 64,
            event_redelivery_limit: 3,
        }
    }
}

impl EngineConfig {
    /// Effective timeout for one task: the declared per-process timeout
    /// capped by the system ceiling; the ceiling alone when undeclared.
    pub fn effective_timeout(&self, declared: Option<Duration>) -> Duration {
        match declared {
            Some(d) if d < self.timeout_ceiling => d,
            _ => self.timeout_ceiling,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_timeout_is_capped() {
        let cfg = EngineConfig::default();
        assert_eq!(
            cfg.effective_timeout(Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            cfg.effective_timeout(Some(Duration::from_secs(999_999))),
            cfg.timeout_ceiling
        );
        assert_eq!(cfg.effective_timeout(None), cfg.timeout_ceiling);
    }
}
