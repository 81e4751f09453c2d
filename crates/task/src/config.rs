//! Task-manager tuning knobs, read from the environment with parsed
//! defaults.

use std::time::Duration;

/// `MUSTER_TASK_QUEUE_CAP`: bound of the fetched-task queue.
const ENV_QUEUE_CAP: &str = "MUSTER_TASK_QUEUE_CAP";
/// `MUSTER_TASK_CONCURRENCY`: max tasks running at once.
const ENV_CONCURRENCY: &str = "MUSTER_TASK_CONCURRENCY";
/// `MUSTER_TASK_FETCH_SECS`: fetch-loop interval in seconds.
const ENV_FETCH_SECS: &str = "MUSTER_TASK_FETCH_SECS";
/// `MUSTER_LOCK_TTL_SECS`: TTL handed to the distributed locker.
const ENV_LOCK_TTL_SECS: &str = "MUSTER_LOCK_TTL_SECS";

#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub queue_cap: usize,
    pub concurrency: usize,
    pub fetch_interval: Duration,
    pub lock_ttl_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            queue_cap: 100,
            concurrency: 10,
            fetch_interval: Duration::from_secs(30),
            lock_ttl_secs: 60,
        }
    }
}

impl TaskConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            queue_cap: env_parse(ENV_QUEUE_CAP, d.queue_cap).max(1),
            concurrency: env_parse(ENV_CONCURRENCY, d.concurrency).max(1),
            fetch_interval: Duration::from_secs(
                env_parse(ENV_FETCH_SECS, d.fetch_interval.as_secs()).max(1),
            ),
            lock_ttl_secs: env_parse(ENV_LOCK_TTL_SECS, d.lock_ttl_secs).max(1),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
