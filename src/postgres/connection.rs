use std::time::Duration;
use tokio::sync::RwLock;
use tokio_postgres::{Client, Config, NoTls};
use tracing::{error, info, warn};

use crate::{Error, Result};

/// A PostgreSQL client that reconnects once the previous connection dies.
///
/// The connection future runs on its own task; when it ends the client
/// reports closed and the next [`client`](Self::client) call dials again.
pub struct PostgresConnection {
    config: Config,
    client: RwLock<Client>,
}

impl PostgresConnection {
    pub async fn connect(dsn: &str, connect_timeout: Duration) -> Result<Self> {
        let mut config = dsn
            .parse::<Config>()
            .map_err(|e| Error::Config(format!("invalid postgres DSN: {}", e)))?;
        config.connect_timeout(connect_timeout);

        let client = Self::open(&config).await?;
        info!("Successfully connected to PostgreSQL");

        Ok(Self {
            config,
            client: RwLock::new(client),
        })
    }

    async fn open(config: &Config) -> Result<Client> {
        let (client, connection) = config.connect(NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Connection error: {}", e);
            }
        });

        Ok(client)
    }

    /// Returns a live client, re-dialing if the current one has closed.
    pub async fn client(&self) -> Result<tokio::sync::RwLockReadGuard<'_, Client>> {
        {
            let client = self.client.read().await;
            if !client.is_closed() {
                return Ok(client);
            }
        }

        let mut client = self.client.write().await;
        if client.is_closed() {
            warn!("PostgreSQL connection closed, reconnecting");
            *client = Self::open(&self.config).await?;
            info!("Reconnected to PostgreSQL");
        }
        Ok(client.downgrade())
    }
}
