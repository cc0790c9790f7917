//! Structured logging for replicas.
//!
//! Every replica (one device in one process) can write its own JSONL file,
//! so several replicas running side by side never share a file:
//!
//! ```text
//! logs/
//! └── raw/
//!     ├── 2026-10-16_alice-laptop.jsonl
//!     └── 2026-10-16_bob-phone.jsonl
//! ```
//!
//! ```ignore
//! use groupsync_core::logging::LoggingBuilder;
//!
//! LoggingBuilder::new("./logs", "alice-laptop")
//!     .with_filter("groupsync_core=debug")
//!     .init()?;
//! ```
//!
//! Query with jq:
//!
//! ```bash
//! jq 'select(.level == "warn")' logs/raw/*.jsonl
//! jq 'select(.fields.group != null) | .fields.group' logs/raw/*.jsonl
//! ```

mod layer;
mod record;

pub use layer::JsonlLayer;
pub use record::LogRecord;

use std::path::PathBuf;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::error::{GroupError, GroupResult};

/// Filter used when neither `RUST_LOG` nor [`LoggingBuilder::with_filter`] is set.
pub const DEFAULT_FILTER: &str = "groupsync_core=info";

/// Builder for a replica's tracing subscriber.
pub struct LoggingBuilder {
    logs_dir: Option<PathBuf>,
    instance: String,
    console_output: bool,
    env_filter: Option<String>,
}

impl LoggingBuilder {
    /// Log to `<logs_dir>/raw/<date>_<instance>.jsonl` and to the console.
    pub fn new(logs_dir: impl Into<PathBuf>, instance: impl Into<String>) -> Self {
        Self {
            logs_dir: Some(logs_dir.into()),
            instance: instance.into(),
            console_output: true,
            env_filter: None,
        }
    }

    /// Console output only.
    pub fn console(instance: impl Into<String>) -> Self {
        Self {
            logs_dir: None,
            instance: instance.into(),
            console_output: true,
            env_filter: None,
        }
    }

    pub fn no_console(mut self) -> Self {
        self.console_output = false;
        self
    }

    /// Set the filter directive, e.g. `"groupsync_core=debug"`.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// The JSONL layer alone, for composing with other layers.
    pub fn build_layer(&self) -> GroupResult<Option<JsonlLayer>> {
        match &self.logs_dir {
            Some(dir) => Ok(Some(JsonlLayer::new(dir, &self.instance)?)),
            None => Ok(None),
        }
    }

    pub fn build_filter(&self) -> GroupResult<EnvFilter> {
        match &self.env_filter {
            Some(directives) => EnvFilter::try_new(directives)
                .map_err(|e| GroupError::InvalidInput(format!("invalid log filter: {}", e))),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
        }
    }

    /// Install as the global default subscriber.
    pub fn init(self) -> GroupResult<()> {
        let filter = self.build_filter()?;
        let jsonl = self.build_layer()?;
        let console = self
            .console_output
            .then(|| tracing_subscriber::fmt::layer().with_target(true));

        tracing_subscriber::registry()
            .with(filter)
            .with(jsonl)
            .with(console)
            .try_init()
            .map_err(|e| GroupError::Internal(format!("logging already initialized: {}", e)))
    }
}
