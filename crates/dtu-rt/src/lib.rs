//! ---
//! dtu_section: "01-core-functionality"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Runtime helpers supporting the bridge daemon."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
//! Scheduling helpers for the bridge runtime.

pub mod daily;
pub mod scheduling;

pub use daily::{spawn_daily, DailyJob, DailySchedule};
pub use scheduling::{RateLimiter, TaskSet};
