use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use surrealdb::engine::any::{self, Any};
use surrealdb::opt::auth::Root;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConnection {
    /// `ws://host:port` for a server, `mem://` for the embedded engine.
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub namespace: String,
    pub database: String,
}

impl Default for DbConnection {
    fn default() -> Self {
        Self {
            endpoint: env::var("PLAYCRON_DB_ENDPOINT").unwrap_or("ws://127.0.0.1:4030".to_string()),
            username: env::var("PLAYCRON_DB_USERNAME").unwrap_or(String::new()),
            password: env::var("PLAYCRON_DB_PASSWORD").unwrap_or(String::new()),
            namespace: env::var("PLAYCRON_DB_NAMESPACE").unwrap_or("playcron".to_string()),
            database: env::var("PLAYCRON_DB_NAME").unwrap_or("playcron".to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct KeyRow {
    #[allow(dead_code)]
    uid: String,
}

/// Shared SurrealDB client.
///
/// Records are keyed by their `uid` field: the same value is used as the
/// record key so rows can be addressed with `type::thing($table, $id)` and
/// read back without SurrealDB's own id (`OMIT id`).
#[derive(Debug, Clone)]
pub struct Db {
    pub client: Arc<Surreal<Any>>,
    claims: Arc<Mutex<()>>,
}

impl Db {
    pub async fn new(config: Option<DbConnection>) -> Result<Self> {
        let config: DbConnection = config.unwrap_or_default();
        let client: Surreal<Any> = any::connect(config.endpoint.as_str()).await?;
        if !config.username.is_empty() {
            client
                .signin(Root {
                    username: config.username.as_str(),
                    password: config.password.as_str(),
                })
                .await?;
        }
        client.use_ns(config.namespace).use_db(config.database).await?;
        debug!("connected to database at {}", config.endpoint);
        Ok(Self {
            client: Arc::new(client),
            claims: Arc::new(Mutex::new(())),
        })
    }

    pub async fn create<T: Serialize>(&self, table: &str, id: &str, data: &T) -> Result<()> {
        let content: Value = serde_json::to_value(data)?;
        let response = self
            .client
            .query("CREATE type::thing($table, $id) CONTENT $content RETURN NONE")
            .bind(("table", table.to_string()))
            .bind(("id", id.to_string()))
            .bind(("content", content))
            .await?;
        response.check()?;
        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(&self, table: &str, id: &str) -> Result<Option<T>> {
        let mut response = self
            .client
            .query("SELECT * OMIT id FROM type::thing($table, $id)")
            .bind(("table", table.to_string()))
            .bind(("id", id.to_string()))
            .await?;
        Ok(response.take::<Option<T>>(0)?)
    }

    /// Lists rows of `table` matching every condition (joined with AND).
    pub async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        conditions: Vec<String>,
        mut bindings: HashMap<String, Value>,
        order_by: Option<&str>,
        limit: Option<u64>,
    ) -> Result<Vec<T>> {
        bindings.insert("table".to_string(), Value::String(table.to_string()));
        let mut stmt = String::from("SELECT * OMIT id FROM type::table($table)");
        if !conditions.is_empty() {
            stmt.push_str(format!(" WHERE {}", conditions.join(" AND ")).as_str());
        }
        if let Some(order_by) = order_by {
            stmt.push_str(format!(" ORDER BY {}", order_by).as_str());
        }
        if let Some(limit) = limit {
            stmt.push_str(format!(" LIMIT {}", limit).as_str());
        }
        let mut response = self.client.query(stmt).bind(bindings).await?;
        Ok(response.take::<Vec<T>>(0)?)
    }

    /// Merges `patch` into an existing row. Returns false when the row does not exist.
    pub async fn merge(&self, table: &str, id: &str, patch: Value) -> Result<bool> {
        let mut response = self
            .client
            .query("UPDATE type::thing($table, $id) MERGE $patch RETURN uid")
            .bind(("table", table.to_string()))
            .bind(("id", id.to_string()))
            .bind(("patch", patch))
            .await?;
        let rows: Vec<KeyRow> = response.take(0)?;
        Ok(!rows.is_empty())
    }

    /// Sets `field` to `value` only when its current value is one of `allowed`.
    /// Returns false when the row is missing or the guard did not match.
    pub async fn compare_and_set(&self, table: &str, id: &str, field: &str, value: Value, allowed: Vec<Value>) -> Result<bool> {
        let stmt = format!(
            "UPDATE type::thing($table, $id) SET {field} = $value WHERE {field} IN $allowed RETURN uid",
            field = field
        );
        let mut response = self
            .client
            .query(stmt)
            .bind(("table", table.to_string()))
            .bind(("id", id.to_string()))
            .bind(("value", value))
            .bind(("allowed", Value::Array(allowed)))
            .await?;
        let rows: Vec<KeyRow> = response.take(0)?;
        Ok(!rows.is_empty())
    }

    pub async fn remove(&self, table: &str, id: &str) -> Result<()> {
        let response = self
            .client
            .query("DELETE type::thing($table, $id) RETURN NONE")
            .bind(("table", table.to_string()))
            .bind(("id", id.to_string()))
            .await?;
        response.check()?;
        Ok(())
    }

    /// Removes and returns the first row of `table` in `order_by` order.
    ///
    /// Select and delete run in one transaction. Claims issued through the
    /// same client are serialized as well, since the embedded engine does
    /// not reject the second of two overlapping deletes.
    pub async fn take_first<T: DeserializeOwned>(&self, table: &str, order_by: &str) -> Result<Option<T>> {
        let _claim = self.claims.lock().await;
        let stmt = format!(
            "BEGIN TRANSACTION;
            LET $first = (SELECT * FROM type::table($table) ORDER BY {order_by} LIMIT 1);
            DELETE $first.id RETURN BEFORE;
            COMMIT TRANSACTION;",
            order_by = order_by
        );
        let mut response = self.client.query(stmt).bind(("table", table.to_string())).await?;
        let last: usize = response.num_statements().saturating_sub(1);
        let mut rows: Vec<T> = response.take(last)?;
        Ok(rows.pop())
    }

    pub async fn purge(&self, table: &str) -> Result<()> {
        let response = self
            .client
            .query("DELETE type::table($table) RETURN NONE")
            .bind(("table", table.to_string()))
            .await?;
        response.check()?;
        Ok(())
    }
}

/// Bindings for [`Db::select`].
pub fn bindings<const N: usize>(values: [(&str, Value); N]) -> HashMap<String, Value> {
    values.into_iter().map(|(key, value)| (key.to_string(), value)).collect()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
