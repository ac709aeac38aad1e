//! ---
//! dtu_section: "02-telemetry-pipeline"
//! dtu_subsection: "module"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Telemetry ingestion, materialization and guard pipeline."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

const COUNT_PLACEHOLDER: &str = "%count%";

/// Dot-separated identifier of a node in the destination state tree.
///
/// The first segment is the record root (inverter serial, `total` or `dtu`),
/// the last segment the terminal field name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DevicePath(String);

impl DevicePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Append a relative id, resolving the `%count%` placeholder with `index` when given.
    pub fn child(&self, suffix: &str) -> Self {
        Self(format!("{}.{}", self.0, suffix))
    }

    pub fn resolve(&self, suffix: &str, index: Option<usize>) -> Self {
        match index {
            Some(index) => self.child(&suffix.replace(COUNT_PLACEHOLDER, &index.to_string())),
            None => self.child(suffix),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    pub fn root(&self) -> &str {
        self.0.split('.').next().unwrap_or_default()
    }

    pub fn terminal(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or_default()
    }

    /// True when the path equals `root` or lies below it.
    pub fn is_under(&self, root: &str) -> bool {
        self.0 == root
            || (self.0.len() > root.len()
                && self.0.starts_with(root)
                && self.0.as_bytes()[root.len()] == b'.')
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DevicePath {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DevicePath {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for DevicePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
