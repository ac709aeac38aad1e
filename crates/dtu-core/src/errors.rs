//! ---
//! dtu_section: "02-telemetry-pipeline"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Telemetry ingestion, materialization and guard pipeline."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
use thiserror::Error;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed telemetry message: {0}")]
    MalformedMessage(#[from] serde_json::Error),
    #[error("telemetry message must be a JSON object")]
    NotAnObject,
    #[error("state store error: {0}")]
    Store(#[from] StoreError),
    #[error("control relay error: {0}")]
    Relay(String),
}
