use std::time::{Duration, Instant};

pub const DEFAULT_FLUSH_AFTER_MUTATIONS: u64 = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Decides when the index snapshot is rewritten.
pub trait FlushPolicy: Send + Sync {
    fn should_flush(&self, mutation_count: u64, elapsed_since_last_flush: Duration) -> bool;
}

/// Flushes after `max_mutations` puts or once `max_interval` has passed since
/// the last flush, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultFlushPolicy {
    pub max_mutations: u64,
    pub max_interval: Duration,
}

impl DefaultFlushPolicy {
    pub fn new(max_mutations: u64, max_interval: Duration) -> Self {
        Self {
            max_mutations,
            max_interval,
        }
    }
}

impl Default for DefaultFlushPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_FLUSH_AFTER_MUTATIONS, DEFAULT_FLUSH_INTERVAL)
    }
}

impl FlushPolicy for DefaultFlushPolicy {
    fn should_flush(&self, mutation_count: u64, elapsed_since_last_flush: Duration) -> bool {
        mutation_count >= self.max_mutations || elapsed_since_last_flush >= self.max_interval
    }
}

/// Mutations recorded since the last snapshot.
#[derive(Debug)]
pub struct FlushState {
    mutations: u64,
    last_flush: Instant,
}

impl FlushState {
    pub fn new() -> Self {
        Self {
            mutations: 0,
            last_flush: Instant::now(),
        }
    }

    /// Counts one mutation and reports whether `policy` asks for a flush now.
    pub fn record(&mut self, policy: &dyn FlushPolicy) -> bool {
        self.mutations = self.mutations.saturating_add(1);
        policy.should_flush(self.mutations, self.last_flush.elapsed())
    }

    pub fn reset(&mut self) {
        self.mutations = 0;
        self.last_flush = Instant::now();
    }

    pub fn mutations(&self) -> u64 {
        self.mutations
    }
}

impl Default for FlushState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_flushes_on_count_or_interval() {
        let policy = DefaultFlushPolicy::new(3, Duration::from_secs(10));
        assert!(!policy.should_flush(1, Duration::from_secs(1)));
        assert!(!policy.should_flush(2, Duration::from_secs(9)));
        assert!(policy.should_flush(3, Duration::ZERO));
        assert!(policy.should_flush(1, Duration::from_secs(10)));
    }

    #[test]
    fn flush_state_counts_until_reset() {
        let policy = DefaultFlushPolicy::new(2, Duration::from_secs(3600));
        let mut state = FlushState::new();
        assert!(!state.record(&policy));
        assert!(state.record(&policy));
        assert_eq!(state.mutations(), 2);
        state.reset();
        assert_eq!(state.mutations(), 0);
        assert!(!state.record(&policy));
    }
}
