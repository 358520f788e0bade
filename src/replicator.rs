use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{error, info};

use crate::polling::PollingReplication;
use crate::postgres::{Lsn, PgSqlClient, SqlClient};
use crate::{Config, Error, Result};

/// Runs the command-line actions against the configured database.
pub struct Replicator {
    config: Config,
}

impl Replicator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    async fn connect(&self) -> Result<PgSqlClient> {
        PgSqlClient::connect(&self.config.pg_config()).await
    }

    /// Polls the slot and writes each change as one JSON line to stdout
    /// until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        let client = self.connect().await?;
        let engine = PollingReplication::new(client, self.config.replication.polling_options());
        let handle = engine.handle();

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
                if let Err(e) = handle.stop() {
                    error!("Failed to stop polling: {}", e);
                }
            }
        });

        let written = write_changes(engine.into_stream(), tokio::io::stdout()).await?;
        info!(changes = written, "Replicator stopped");
        Ok(())
    }

    pub async fn create_slot(&self) -> Result<()> {
        let mut client = self.connect().await?;
        let replication = &self.config.replication;
        let created = crate::postgres::ensure_slot(&client, &replication.slot_name, replication.temporary).await;
        client.close().await?;

        if !created? {
            info!("Replication slot '{}' already exists", replication.slot_name);
        }
        Ok(())
    }

    pub async fn drop_slot(&self) -> Result<()> {
        let mut client = self.connect().await?;
        let result = client.drop_slot(&self.config.replication.slot_name).await;
        client.close().await?;
        result
    }

    pub async fn current_lsn(&self) -> Result<Lsn> {
        let mut client = self.connect().await?;
        let lsn = client.current_wal_lsn().await;
        client.close().await?;

        lsn?.map(|text| Lsn::parse(&text)).ok_or_else(|| Error::Replication {
            message: "pg_current_wal_lsn() returned no position".to_string(),
        })
    }
}

/// Writes every change of `changes` as a JSON line, stopping at the first
/// error. Returns how many changes were written.
pub async fn write_changes<S, W>(changes: S, mut out: W) -> Result<u64>
where
    S: futures::Stream<Item = Result<crate::postgres::Change>>,
    W: AsyncWrite + Unpin,
{
    let mut changes = std::pin::pin!(changes);
    let mut written = 0;

    while let Some(change) = changes.next().await {
        let mut line = serde_json::to_vec(&change?)?;
        line.push(b'\n');
        out.write_all(&line).await?;
        written += 1;
    }

    out.flush().await?;
    Ok(written)
}
