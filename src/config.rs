use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::polling::PollingOptions;
use crate::postgres::Lsn;
use crate::streaming::StreamingOptions;
use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub replication: ReplicationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    pub slot_name: String,
    #[serde(default)]
    pub temporary: bool,
    #[serde(default)]
    pub destroy_slot_on_close: bool,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default)]
    pub start_lsn: Option<String>,
    #[serde(default)]
    pub update_interval_ms: u64,
    #[serde(default)]
    pub auto_ack_lsn: bool,
    #[serde(default)]
    pub checkpoint_file: Option<PathBuf>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_LOGICAL")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.replication.validate()
    }

    /// Connection settings for the SQL session.
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.postgres.host)
            .port(self.postgres.port)
            .dbname(&self.postgres.database)
            .user(&self.postgres.username)
            .connect_timeout(Duration::from_secs(self.postgres.connect_timeout_secs));
        if !self.postgres.password.is_empty() {
            config.password(&self.postgres.password);
        }
        config
    }
}

impl ReplicationConfig {
    /// The slot name is interpolated into `START_REPLICATION`, so only
    /// PostgreSQL's own slot-name alphabet is accepted.
    pub fn validate(&self) -> Result<()> {
        if self.slot_name.is_empty() {
            return Err(Error::Config("replication.slot_name must not be empty".to_string()));
        }
        if !self
            .slot_name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(Error::Config(format!(
                "replication.slot_name {:?} may only contain lower case letters, digits and underscores",
                self.slot_name
            )));
        }
        if let Some(lsn) = &self.start_lsn {
            if Lsn::parse(lsn).is_empty() && lsn.trim() != "0/0" {
                return Err(Error::Config(format!("replication.start_lsn {lsn:?} is not a valid LSN")));
            }
        }
        Ok(())
    }

    pub fn streaming_options(&self) -> StreamingOptions {
        StreamingOptions {
            slot_name: self.slot_name.clone(),
            start_lsn: self.start_lsn.clone(),
            update_interval: Duration::from_millis(self.update_interval_ms),
            auto_ack_lsn: self.auto_ack_lsn,
            ensure_slot: true,
            temporary: self.temporary,
            destroy_slot_on_close: self.destroy_slot_on_close,
            checkpoint_file: self.checkpoint_file.clone(),
        }
    }

    pub fn polling_options(&self) -> PollingOptions {
        PollingOptions {
            slot_name: self.slot_name.clone(),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            temporary: self.temporary,
            destroy_slot_on_close: self.destroy_slot_on_close,
        }
    }
}

fn default_port() -> u16 {
    5432
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_poll_timeout_ms() -> u64 {
    1000
}
