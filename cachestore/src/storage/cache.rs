use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Paces expiry sweeps for in-process backends.
///
/// Expired entries are always invisible to reads; sweeping only reclaims
/// memory, so it is rate limited rather than run on every write.
#[derive(Clone)]
pub struct EvictionManager {
    last_sweep: Arc<RwLock<Instant>>,
    min_sweep_interval: Duration,
}

impl EvictionManager {
    /// Creates a manager allowing at most one sweep per `min_sweep_interval`.
    pub fn new(min_sweep_interval: Duration) -> Self {
        Self {
            last_sweep: Arc::new(RwLock::new(Instant::now())),
            min_sweep_interval,
        }
    }

    /// Returns true, and records the sweep, if enough time has passed since the last one.
    pub async fn should_sweep(&self) -> bool {
        let now = Instant::now();
        {
            let last = *self.last_sweep.read().await;
            if now.saturating_duration_since(last) < self.min_sweep_interval {
                return false;
            }
        }

        let mut last = self.last_sweep.write().await;
        // Another caller may have swept between the read and the write.
        if now.saturating_duration_since(*last) < self.min_sweep_interval {
            return false;
        }
        *last = now;
        true
    }
}

impl Default for EvictionManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

/// Backends that hold expired entries until they are swept.
#[async_trait::async_trait]
pub trait ExpirySweep {
    /// Removes expired entries, returning how many were dropped.
    async fn sweep_expired(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sweeps_are_rate_limited() {
        let manager = EvictionManager::new(Duration::from_secs(10));
        assert!(!manager.should_sweep().await);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(manager.should_sweep().await);
        assert!(!manager.should_sweep().await);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(manager.should_sweep().await);
    }
}
