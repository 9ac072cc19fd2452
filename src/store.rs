use crate::{
    OwnerId, Result,
    documents::{DEFAULT_NOTIFY_CHANNEL, PgDocuments},
    schema::{SchemaConfig, SchemaManager},
    transport::{DocumentBackend, DocumentStore},
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;

/// Postgres-backed document backend. Cheap to clone; hands out owner-scoped handles.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    schema: String,
    notify_channel: Option<String>,
}

impl Store {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema: "public".to_string(),
            notify_channel: Some(DEFAULT_NOTIFY_CHANNEL.to_string()),
        }
    }

    pub fn builder(url: impl Into<String>) -> StoreBuilder {
        StoreBuilder::new(url)
    }

    /// Document handle scoped to `owner`.
    pub fn docs(&self, owner: &OwnerId) -> PgDocuments {
        PgDocuments::new(
            self.pool.clone(),
            &self.schema,
            owner.clone(),
            self.notify_channel.clone(),
        )
    }

    pub fn schema(&self) -> SchemaManager {
        SchemaManager::new(self.pool.clone())
    }

    pub fn schema_config(&self) -> SchemaConfig {
        SchemaConfig::with_base_schema(self.schema.clone())
    }

    /// Create any missing tables and indexes in the configured schema.
    pub async fn migrate(&self) -> Result<()> {
        self.schema().sync(&self.schema_config()).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema_name(&self) -> &str {
        &self.schema
    }

    /// Lightweight liveness check for the connection pool.
    pub async fn pool_health(&self) -> Result<PoolHealth> {
        let one: i32 = sqlx::query_scalar("select 1").fetch_one(&self.pool).await?;
        Ok(PoolHealth { ok: one == 1 })
    }
}

impl DocumentBackend for Store {
    fn for_owner(&self, owner: &OwnerId) -> Arc<dyn DocumentStore> {
        Arc::new(self.docs(owner))
    }
}

pub struct StoreBuilder {
    url: String,
    max_connections: Option<u32>,
    connect_timeout: Option<Duration>,
    schema: String,
    notify_channel: Option<String>,
}

impl StoreBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: None,
            connect_timeout: None,
            schema: "public".to_string(),
            notify_channel: Some(DEFAULT_NOTIFY_CHANNEL.to_string()),
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max.max(1));
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Postgres schema holding the document tables.
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Channel writes `pg_notify` on; `None` leaves subscriptions purely polling.
    pub fn notify_channel(mut self, channel: Option<String>) -> Self {
        self.notify_channel = channel;
        self
    }

    pub async fn build(self) -> Result<Store> {
        let mut opts = PgPoolOptions::new();
        if let Some(max) = self.max_connections {
            opts = opts.max_connections(max);
        }
        if let Some(t) = self.connect_timeout {
            opts = opts.acquire_timeout(t);
        }
        let pool = opts.connect(&self.url).await?;
        Ok(Store {
            pool,
            schema: self.schema,
            notify_channel: self.notify_channel,
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PoolHealth {
    pub ok: bool,
}
