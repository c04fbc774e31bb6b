//! Redis-backed store for the SWSS databases
//!
//! Records are Redis hashes named `TABLE<sep>key`, where the separator is
//! `:` in APPL_DB and `|` in CONFIG_DB/STATE_DB.

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::store::StoreClient;
use crate::types::{DbId, FieldValues};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, instrument};

/// Placeholder written when a record has no attributes; Redis hashes
/// cannot be empty.
const EMPTY_FIELD: (&str, &str) = ("NULL", "NULL");

/// Redis store connected to APPL_DB, CONFIG_DB and STATE_DB.
pub struct RedisStore {
    appl_db: ConnectionManager,
    config_db: ConnectionManager,
    state_db: ConnectionManager,
}

impl RedisStore {
    /// Connect to all three databases.
    #[instrument(skip_all)]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        debug!(
            host = %config.redis_host,
            port = config.redis_port,
            "Connecting to Redis databases"
        );

        let appl_db = Self::connect_db(config, config.appl_db).await?;
        let config_db = Self::connect_db(config, config.config_db).await?;
        let state_db = Self::connect_db(config, config.state_db).await?;

        debug!("Connected to all Redis databases");
        Ok(Self {
            appl_db,
            config_db,
            state_db,
        })
    }

    async fn connect_db(config: &DatabaseConfig, db: u32) -> Result<ConnectionManager> {
        let url = format!("redis://{}:{}/{}", config.redis_host, config.redis_port, db);
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(manager)
    }

    fn conn(&mut self, db: DbId) -> &mut ConnectionManager {
        match db {
            DbId::ApplDb => &mut self.appl_db,
            DbId::ConfigDb => &mut self.config_db,
            DbId::StateDb => &mut self.state_db,
        }
    }
}

/// Full Redis key of a record.
pub fn redis_key(db: DbId, table: &str, key: &str) -> String {
    format!("{}{}{}", table, db.separator(), key)
}

#[async_trait]
impl StoreClient for RedisStore {
    async fn set(
        &mut self,
        db: DbId,
        table: &str,
        key: &str,
        fields: &FieldValues,
    ) -> Result<()> {
        let full_key = redis_key(db, table, key);
        let mut pairs: Vec<(&str, &str)> = fields
            .iter()
            .map(|(f, v)| (f.as_str(), v.as_str()))
            .collect();
        if pairs.is_empty() {
            pairs.push(EMPTY_FIELD);
        }

        debug!(db = db.name(), key = %full_key, count = pairs.len(), "HSET");
        let _: () = self.conn(db).hset_multiple(&full_key, &pairs).await?;
        Ok(())
    }

    async fn del(&mut self, db: DbId, table: &str, key: &str) -> Result<()> {
        let full_key = redis_key(db, table, key);
        debug!(db = db.name(), key = %full_key, "DEL");
        let _: () = self.conn(db).del(&full_key).await?;
        Ok(())
    }

    async fn get(&mut self, db: DbId, table: &str, key: &str) -> Result<Option<FieldValues>> {
        let full_key = redis_key(db, table, key);
        let fields: FieldValues = self.conn(db).hgetall(&full_key).await?;
        Ok(if fields.is_empty() { None } else { Some(fields) })
    }

    async fn hget(
        &mut self,
        db: DbId,
        table: &str,
        key: &str,
        field: &str,
    ) -> Result<Option<String>> {
        let full_key = redis_key(db, table, key);
        let value: Option<String> = self.conn(db).hget(&full_key, field).await?;
        Ok(value)
    }

    async fn get_table(&mut self, db: DbId, table: &str) -> Result<Vec<(String, FieldValues)>> {
        let prefix = format!("{}{}", table, db.separator());
        let pattern = format!("{}*", prefix);
        let keys: Vec<String> = self.conn(db).keys(&pattern).await?;

        let mut records = Vec::with_capacity(keys.len());
        for full_key in keys {
            let mut fields: FieldValues = self.conn(db).hgetall(&full_key).await?;
            if fields.is_empty() {
                continue;
            }
            if fields.get(EMPTY_FIELD.0).map(String::as_str) == Some(EMPTY_FIELD.1) {
                fields.remove(EMPTY_FIELD.0);
            }
            let short_key = full_key
                .strip_prefix(&prefix)
                .unwrap_or(&full_key)
                .to_string();
            records.push((short_key, fields));
        }

        records.sort_by(|a, b| a.0.cmp(&b.0));
        debug!(db = db.name(), table, count = records.len(), "Read table");
        Ok(records)
    }
}
