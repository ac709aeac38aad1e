//! ---
//! dtu_section: "01-core-functionality"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Runtime helpers supporting the bridge daemon."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
//! Wall-clock daily jobs, e.g. the yield counter maintenance around midnight.

use chrono::{DateTime, Days, Local, NaiveTime, TimeZone};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct DailyJob<T> {
    pub at: NaiveTime,
    pub job: T,
}

/// Set of jobs each firing once per day at a local wall-clock time.
#[derive(Debug, Clone, PartialEq)]
pub struct DailySchedule<T> {
    jobs: Vec<DailyJob<T>>,
}

impl<T> Default for DailySchedule<T> {
    fn default() -> Self {
        Self { jobs: Vec::new() }
    }
}

impl<T: Clone> DailySchedule<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job(mut self, at: NaiveTime, job: T) -> Self {
        self.jobs.push(DailyJob { at, job });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Earliest job strictly after `now`, with its firing time.
    pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<(DateTime<Tz>, T)> {
        self.jobs
            .iter()
            .filter_map(|entry| next_occurrence(now, entry.at).map(|at| (at, entry.job.clone())))
            .min_by(|a, b| a.0.cmp(&b.0))
    }
}

fn next_occurrence<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> Option<DateTime<Tz>> {
    let tz = now.timezone();
    let today = now.date_naive();
    // two extra days cover a job skipped by a DST gap
    (0..3u64).find_map(|offset| {
        let day = today.checked_add_days(Days::new(offset))?;
        let candidate = tz.from_local_datetime(&day.and_time(at)).earliest()?;
        (candidate > *now).then_some(candidate)
    })
}

/// Spawn a task sending each job into `jobs` at its local time until shutdown.
pub fn spawn_daily<T>(
    schedule: DailySchedule<T>,
    jobs: mpsc::Sender<T>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    T: Clone + std::fmt::Debug + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut last_fired: Option<DateTime<Local>> = None;
        loop {
            let now = Local::now();
            let reference = match last_fired {
                Some(fired) if fired > now => fired,
                _ => now,
            };
            let Some((at, job)) = schedule.next_after(&reference) else {
                debug!("daily schedule empty");
                break;
            };
            let wait = (at - now).to_std().unwrap_or_default();
            debug!(job = ?job, at = %at, "next daily job scheduled");

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("daily scheduler shutdown");
                        break;
                    }
                }
                _ = tokio::time::sleep(wait) => {
                    info!(job = ?job, "running daily job");
                    if jobs.send(job).await.is_err() {
                        warn!("daily job receiver dropped");
                        break;
                    }
                    last_fired = Some(at);
                }
            }
        }
    })
}
