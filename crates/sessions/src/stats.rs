//! Monthly per-instance message counters.

use {
    anyhow::Result,
    async_trait::async_trait,
    chrono::{Datelike, Utc},
    serde::Serialize,
};

#[async_trait]
pub trait MessageStatsRecorder: Send + Sync {
    async fn record_sent(&self, owner_id: &str, instance_key: &str) -> Result<()>;
    async fn record_received(&self, owner_id: &str, instance_key: &str) -> Result<()>;
}

pub struct NoopStats;

#[async_trait]
impl MessageStatsRecorder for NoopStats {
    async fn record_sent(&self, _owner_id: &str, _instance_key: &str) -> Result<()> {
        Ok(())
    }

    async fn record_received(&self, _owner_id: &str, _instance_key: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyStats {
    pub month_year: String,
    pub messages_sent: i64,
    pub messages_received: i64,
}

/// The `YYYY-MM` bucket for the current UTC month.
pub fn current_month() -> String {
    let now = Utc::now();
    format!("{:04}-{:02}", now.year(), now.month())
}

pub struct SqliteMessageStats {
    pool: sqlx::SqlitePool,
}

impl SqliteMessageStats {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `message_stats` table if it doesn't exist.
    pub async fn init(pool: &sqlx::SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS message_stats (
                owner_id          TEXT NOT NULL,
                instance_key      TEXT NOT NULL,
                month_year        TEXT NOT NULL,
                messages_sent     INTEGER NOT NULL DEFAULT 0,
                messages_received INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (owner_id, instance_key, month_year)
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn monthly(
        &self,
        owner_id: &str,
        instance_key: &str,
        month_year: &str,
    ) -> Result<MonthlyStats> {
        let row = sqlx::query_as::<_, MonthlyStats>(
            r#"SELECT month_year, messages_sent, messages_received FROM message_stats
               WHERE owner_id = ? AND instance_key = ? AND month_year = ?"#,
        )
        .bind(owner_id)
        .bind(instance_key)
        .bind(month_year)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.unwrap_or_else(|| MonthlyStats {
            month_year: month_year.to_string(),
            ..Default::default()
        }))
    }

    async fn bump(&self, owner_id: &str, instance_key: &str, column: Counter) -> Result<()> {
        let sql = match column {
            Counter::Sent => {
                r#"INSERT INTO message_stats (owner_id, instance_key, month_year, messages_sent)
                   VALUES (?, ?, ?, 1)
                   ON CONFLICT(owner_id, instance_key, month_year)
                   DO UPDATE SET messages_sent = messages_sent + 1"#
            },
            Counter::Received => {
                r#"INSERT INTO message_stats (owner_id, instance_key, month_year, messages_received)
                   VALUES (?, ?, ?, 1)
                   ON CONFLICT(owner_id, instance_key, month_year)
                   DO UPDATE SET messages_received = messages_received + 1"#
            },
        };
        sqlx::query(sql)
            .bind(owner_id)
            .bind(instance_key)
            .bind(current_month())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Counter {
    Sent,
    Received,
}

#[async_trait]
impl MessageStatsRecorder for SqliteMessageStats {
    async fn record_sent(&self, owner_id: &str, instance_key: &str) -> Result<()> {
        self.bump(owner_id, instance_key, Counter::Sent).await
    }

    async fn record_received(&self, owner_id: &str, instance_key: &str) -> Result<()> {
        self.bump(owner_id, instance_key, Counter::Received).await
    }
}
