use std::env;
use std::fmt;
use std::str::FromStr;

use tracing::info;

use crate::error::SyncError;
use crate::frames::DEFAULT_QUERY_CONCURRENCY;

/// How much the dispatcher reports about each synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Logging {
    /// Nothing.
    Off,
    /// One line per completed action: `Owner.action {input} => {output}`.
    #[default]
    Trace,
    /// Structured record fields plus frames after `when`/`where` and every
    /// `then` firing.
    Verbose,
}

impl FromStr for Logging {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(Logging::Off),
            "trace" => Ok(Logging::Trace),
            "verbose" => Ok(Logging::Verbose),
            other => Err(SyncError::Config(format!(
                "unknown logging level `{other}` (expected off, trace or verbose)"
            ))),
        }
    }
}

impl fmt::Display for Logging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Logging::Off => "off",
            Logging::Trace => "trace",
            Logging::Verbose => "verbose",
        })
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub logging: Logging,
    /// Upper bound on query calls in flight for one [`Frames::query`](crate::Frames::query).
    pub query_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            logging: Logging::default(),
            query_concurrency: DEFAULT_QUERY_CONCURRENCY,
        }
    }
}

impl EngineConfig {
    /// Load from `SYNC_LOGGING` and `SYNC_QUERY_CONCURRENCY`, falling back to
    /// defaults for unset variables.
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SyncError> {
        let mut config = Self::default();
        if let Some(logging) = lookup("SYNC_LOGGING") {
            config.logging = logging.parse()?;
        }
        if let Some(limit) = lookup("SYNC_QUERY_CONCURRENCY") {
            config.query_concurrency = parse_concurrency(&limit)?;
        }
        Ok(config)
    }

    pub fn with_logging(mut self, logging: Logging) -> Self {
        self.logging = logging;
        self
    }

    pub fn with_query_concurrency(mut self, limit: usize) -> Self {
        self.query_concurrency = limit.max(1);
        self
    }

    pub fn log_summary(&self) {
        info!(
            logging = %self.logging,
            query_concurrency = self.query_concurrency,
            "Sync engine config"
        );
    }
}

fn parse_concurrency(raw: &str) -> Result<usize, SyncError> {
    match raw.trim().parse::<usize>() {
        Ok(0) | Err(_) => Err(SyncError::Config(format!(
            "SYNC_QUERY_CONCURRENCY must be a positive integer, got `{raw}`"
        ))),
        Ok(limit) => Ok(limit),
    }
}
