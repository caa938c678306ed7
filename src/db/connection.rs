use anyhow::Result;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::{Client, Config, NoTls, Socket};
use tracing::{error, info, warn};

use crate::config::{DatabaseSettings, SslMode};

/// Driver configuration for the target database.
///
/// The statement timeout and read-only mode travel as startup options, so the server
/// enforces both for every statement on the session.
pub fn pg_config(settings: &DatabaseSettings) -> Config {
    let mut config = Config::new();
    config
        .host(&settings.host)
        .port(settings.port)
        .dbname(&settings.database)
        .user(&settings.user)
        .application_name("sqlscout");
    if !settings.password.is_empty() {
        config.password(&settings.password);
    }

    let mut options = format!("-c statement_timeout={}", settings.statement_timeout_ms);
    if settings.read_only_session {
        options.push_str(" -c default_transaction_read_only=on");
    }
    config.options(&options);

    config.ssl_mode(match settings.ssl_mode {
        SslMode::Disable => tokio_postgres::config::SslMode::Disable,
        SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
        SslMode::Require => tokio_postgres::config::SslMode::Require,
    });
    config
}

async fn connect_with<T>(config: &Config, tls: T) -> Result<Client>
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let (client, connection) = config.connect(tls).await?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!(error = %e, "database connection closed");
        }
    });

    Ok(client)
}

pub async fn connect(settings: &DatabaseSettings) -> Result<Client> {
    let config = pg_config(settings);

    let client = match settings.ssl_mode {
        SslMode::Disable => connect_with(&config, NoTls).await?,
        SslMode::Prefer | SslMode::Require => {
            let connector = native_tls::TlsConnector::builder().build()?;
            let tls = postgres_native_tls::MakeTlsConnector::new(connector);
            connect_with(&config, tls).await?
        }
    };

    let row = client.query_one("SELECT version()", &[]).await?;
    let version: String = row.get(0);
    info!(
        host = %settings.host,
        database = %settings.database,
        read_only = settings.read_only_session,
        %version,
        "connected to database"
    );

    Ok(client)
}

/// Database sessions for the service.
///
/// Short request queries share one session, reopened when the server or network drops
/// it. Row streams get a session of their own: a reader that stops pulling rows stalls
/// only its own socket.
pub struct ConnectionManager {
    settings: DatabaseSettings,
    shared: RwLock<Option<Arc<Client>>>,
}

impl ConnectionManager {
    pub fn new(settings: DatabaseSettings) -> Self {
        Self {
            settings,
            shared: RwLock::new(None),
        }
    }

    /// Open the shared session now, so a bad configuration fails at startup.
    pub async fn connect(settings: DatabaseSettings) -> Result<Self> {
        let manager = Self::new(settings);
        manager.shared().await?;
        Ok(manager)
    }

    pub async fn shared(&self) -> Result<Arc<Client>> {
        if let Some(client) = self.shared.read().await.as_ref().filter(|c| !c.is_closed()) {
            return Ok(client.clone());
        }

        let mut slot = self.shared.write().await;
        if let Some(client) = slot.as_ref().filter(|c| !c.is_closed()) {
            return Ok(client.clone());
        }
        if slot.is_some() {
            warn!("database session closed, reconnecting");
        }
        let client = Arc::new(connect(&self.settings).await?);
        *slot = Some(client.clone());
        Ok(client)
    }

    /// A fresh session owned by the caller. Dropping the client closes it.
    pub async fn dedicated(&self) -> Result<Client> {
        connect(&self.settings).await
    }
}
