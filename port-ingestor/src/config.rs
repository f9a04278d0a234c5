use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use port_common::stream::TrailingContent;

use crate::ingestor::{default_concurrency, IngestorConfig};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "DATA_DIR", default = "data")]
    pub data_dir: PathBuf,

    /// Falls back to the host's available parallelism when unset.
    #[envconfig(from = "MAX_CONCURRENT_UPSERTS")]
    pub max_concurrent_upserts: Option<NonZeroUsize>,

    #[envconfig(from = "INGEST_TIMEOUT")]
    pub ingest_timeout: Option<EnvMsDuration>,

    #[envconfig(from = "REJECT_TRAILING_CONTENT", default = "false")]
    pub reject_trailing_content: bool,

    /// Document ingested by default, relative to `data_dir`.
    #[envconfig(from = "PORTS_FILE", default = "ports.json")]
    pub ports_file: PathBuf,
}

impl Config {
    /// Resolve every optional setting into the explicit values an Ingestor runs with.
    pub fn ingestor_config(&self) -> IngestorConfig {
        let trailing_content = if self.reject_trailing_content {
            TrailingContent::Reject
        } else {
            TrailingContent::Ignore
        };

        IngestorConfig {
            data_dir: self.data_dir.clone(),
            max_concurrent_upserts: self
                .max_concurrent_upserts
                .unwrap_or_else(default_concurrency),
            timeout: self.ingest_timeout.map(|timeout| timeout.0),
            trailing_content,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl std::fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("expected a duration in milliseconds")
    }
}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
