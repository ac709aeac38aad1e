//! ---
//! dtu_section: "01-core-functionality"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Runtime helpers supporting the bridge daemon."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error};

/// Fixed-period ticker that delays rather than bursts after a slow iteration.
#[derive(Debug)]
pub struct RateLimiter {
    interval: tokio::time::Interval,
}

impl RateLimiter {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }
}

/// Named background tasks joined one by one on shutdown.
#[derive(Debug, Default)]
pub struct TaskSet {
    tasks: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

impl TaskSet {
    pub fn spawn<F>(&mut self, name: &'static str, fut: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        self.tasks.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Await every task. A failing task is logged and does not stop the others.
    /// Returns the number of tasks that ended with an error.
    pub async fn join(self) -> usize {
        let mut failures = 0;
        for (name, task) in self.tasks {
            match task.await {
                Ok(Ok(())) => debug!(task = name, "task stopped"),
                Ok(Err(err)) => {
                    failures += 1;
                    error!(task = name, error = %err, "task ended with error");
                }
                Err(err) => {
                    failures += 1;
                    error!(task = name, error = %err, "task join failure");
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_ticks_at_period() {
        let mut limiter = RateLimiter::new(Duration::from_secs(10));
        let first = limiter.tick().await;
        let second = limiter.tick().await;
        assert_eq!(second - first, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn task_set_counts_failures_without_stopping() {
        let mut tasks = TaskSet::default();
        tasks.spawn("ok", async { Ok(()) });
        tasks.spawn("broken", async { Err(anyhow::anyhow!("boom")) });
        tasks.spawn("also-ok", async { Ok(()) });
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks.join().await, 1);
    }
}
