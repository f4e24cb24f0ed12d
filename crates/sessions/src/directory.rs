//! Tenant instance records: who owns an instance, where its inbound messages
//! go, and which session currently serves it.

use {anyhow::Result, async_trait::async_trait, serde::Serialize};

use crate::model::now_ms;

/// What the manager needs to know about one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantBinding {
    pub instance_key: String,
    pub owner_id: String,
    pub webhook_url: Option<String>,
    pub session_id: Option<String>,
    pub connected: bool,
}

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn binding_for_instance(&self, instance_key: &str) -> Result<Option<TenantBinding>>;

    /// Used on restore to recover the owner and webhook target of a stored session.
    async fn binding_for_session(&self, session_id: &str) -> Result<Option<TenantBinding>>;

    /// Point the owner's instance at a new session. False when no such instance exists.
    async fn bind_session(&self, owner_id: &str, instance_key: &str, session_id: &str)
    -> Result<bool>;

    async fn set_connected(&self, session_id: &str, connected: bool) -> Result<()>;
}

/// Directory for deployments without instance records.
pub struct NoopDirectory;

#[async_trait]
impl TenantDirectory for NoopDirectory {
    async fn binding_for_instance(&self, _instance_key: &str) -> Result<Option<TenantBinding>> {
        Ok(None)
    }

    async fn binding_for_session(&self, _session_id: &str) -> Result<Option<TenantBinding>> {
        Ok(None)
    }

    async fn bind_session(
        &self,
        _owner_id: &str,
        _instance_key: &str,
        _session_id: &str,
    ) -> Result<bool> {
        Ok(false)
    }

    async fn set_connected(&self, _session_id: &str, _connected: bool) -> Result<()> {
        Ok(())
    }
}

// ── SQLite-backed directory ─────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct InstanceRow {
    key: String,
    owner_id: String,
    webhook_url: Option<String>,
    session_id: Option<String>,
    connected: i32,
}

impl From<InstanceRow> for TenantBinding {
    fn from(r: InstanceRow) -> Self {
        Self {
            instance_key: r.key,
            owner_id: r.owner_id,
            webhook_url: r.webhook_url,
            session_id: r.session_id,
            connected: r.connected != 0,
        }
    }
}

const SELECT_INSTANCE: &str =
    "SELECT key, owner_id, webhook_url, session_id, connected FROM instances";

pub struct SqliteTenantDirectory {
    pool: sqlx::SqlitePool,
}

impl SqliteTenantDirectory {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `instances` table if it doesn't exist.
    pub async fn init(pool: &sqlx::SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS instances (
                key         TEXT PRIMARY KEY,
                owner_id    TEXT NOT NULL,
                webhook_url TEXT,
                session_id  TEXT,
                connected   INTEGER NOT NULL DEFAULT 0,
                created_at  INTEGER NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_instances_session ON instances(session_id)")
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Insert an instance, or update its owner and webhook if the key exists.
    pub async fn register_instance(
        &self,
        owner_id: &str,
        key: &str,
        webhook_url: Option<&str>,
    ) -> Result<TenantBinding> {
        sqlx::query(
            r#"INSERT INTO instances (key, owner_id, webhook_url, created_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(key) DO UPDATE SET
                 owner_id = excluded.owner_id,
                 webhook_url = COALESCE(excluded.webhook_url, instances.webhook_url)"#,
        )
        .bind(key)
        .bind(owner_id)
        .bind(webhook_url)
        .bind(now_ms() as i64)
        .execute(&self.pool)
        .await?;
        self.binding_for_instance(key)
            .await?
            .ok_or_else(|| anyhow::anyhow!("instance '{key}' vanished after insert"))
    }

    pub async fn set_webhook(&self, key: &str, url: Option<&str>) -> Result<bool> {
        let res = sqlx::query("UPDATE instances SET webhook_url = ? WHERE key = ?")
            .bind(url)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn list_instances(&self, owner_id: Option<&str>) -> Result<Vec<TenantBinding>> {
        let rows = match owner_id {
            Some(owner) => {
                sqlx::query_as::<_, InstanceRow>(&format!(
                    "{SELECT_INSTANCE} WHERE owner_id = ? ORDER BY created_at ASC"
                ))
                .bind(owner)
                .fetch_all(&self.pool)
                .await?
            },
            None => {
                sqlx::query_as::<_, InstanceRow>(&format!(
                    "{SELECT_INSTANCE} ORDER BY created_at ASC"
                ))
                .fetch_all(&self.pool)
                .await?
            },
        };
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl TenantDirectory for SqliteTenantDirectory {
    async fn binding_for_instance(&self, instance_key: &str) -> Result<Option<TenantBinding>> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!("{SELECT_INSTANCE} WHERE key = ?"))
            .bind(instance_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn binding_for_session(&self, session_id: &str) -> Result<Option<TenantBinding>> {
        let row =
            sqlx::query_as::<_, InstanceRow>(&format!("{SELECT_INSTANCE} WHERE session_id = ?"))
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Into::into))
    }

    async fn bind_session(
        &self,
        owner_id: &str,
        instance_key: &str,
        session_id: &str,
    ) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE instances SET session_id = ?, connected = 0 WHERE key = ? AND owner_id = ?",
        )
        .bind(session_id)
        .bind(instance_key)
        .bind(owner_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn set_connected(&self, session_id: &str, connected: bool) -> Result<()> {
        sqlx::query("UPDATE instances SET connected = ? WHERE session_id = ?")
            .bind(connected as i32)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn directory() -> SqliteTenantDirectory {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        SqliteTenantDirectory::init(&pool).await.unwrap();
        SqliteTenantDirectory::new(pool)
    }

    #[tokio::test]
    async fn register_and_look_up_instance() {
        let dir = directory().await;
        let b = dir
            .register_instance("u1", "key-a", Some("https://hooks.example/a"))
            .await
            .unwrap();
        assert_eq!(b.owner_id, "u1");
        assert_eq!(b.webhook_url.as_deref(), Some("https://hooks.example/a"));
        assert!(b.session_id.is_none());
        assert!(!b.connected);

        assert!(dir.binding_for_instance("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reregistering_keeps_existing_webhook() {
        let dir = directory().await;
        dir.register_instance("u1", "k", Some("https://a")).await.unwrap();
        let b = dir.register_instance("u1", "k", None).await.unwrap();
        assert_eq!(b.webhook_url.as_deref(), Some("https://a"));

        assert!(dir.set_webhook("k", Some("https://b")).await.unwrap());
        assert!(!dir.set_webhook("nope", Some("https://b")).await.unwrap());
        let b = dir.binding_for_instance("k").await.unwrap().unwrap();
        assert_eq!(b.webhook_url.as_deref(), Some("https://b"));
    }

    #[tokio::test]
    async fn bind_session_requires_matching_owner() {
        let dir = directory().await;
        dir.register_instance("u1", "k", None).await.unwrap();

        assert!(!dir.bind_session("u2", "k", "s1").await.unwrap());
        assert!(!dir.bind_session("u1", "other", "s1").await.unwrap());
        assert!(dir.bind_session("u1", "k", "s1").await.unwrap());

        dir.set_connected("s1", true).await.unwrap();
        let b = dir.binding_for_session("s1").await.unwrap().unwrap();
        assert_eq!(b.instance_key, "k");
        assert!(b.connected);

        // Rebinding resets the connected flag for the new session.
        assert!(dir.bind_session("u1", "k", "s2").await.unwrap());
        assert!(dir.binding_for_session("s1").await.unwrap().is_none());
        assert!(!dir.binding_for_session("s2").await.unwrap().unwrap().connected);
    }

    #[tokio::test]
    async fn list_filters_by_owner() {
        let dir = directory().await;
        dir.register_instance("u1", "a", None).await.unwrap();
        dir.register_instance("u2", "b", None).await.unwrap();
        dir.register_instance("u1", "c", None).await.unwrap();

        assert_eq!(dir.list_instances(None).await.unwrap().len(), 3);
        let keys: Vec<_> = dir
            .list_instances(Some("u1"))
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.instance_key)
            .collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&"a".to_string()) && keys.contains(&"c".to_string()));
    }
}
