use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::storage::traits::Storage;
use crate::types::{
    CoordinationSession, Message, MessageId, SessionId, SessionReport, Task, TaskId,
};

/// Append-only Postgres backend. Entities are stored as JSONB documents; the
/// indexed columns exist for point reads and ordering only.
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../../migrations/V001__initial_schema.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn append_session(&self, session: &CoordinationSession) -> Result<()> {
        // The message log lives in its own table.
        let mut header = session.clone();
        header.context.clear();

        sqlx::query(
            r#"
            INSERT INTO session_versions (session_id, goal, iteration, result, document, recorded_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(session.id)
        .bind(&session.goal)
        .bind(session.iteration as i32)
        .bind(session.result.map(|r| r.as_str().to_string()))
        .bind(serde_json::to_value(&header)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<CoordinationSession>> {
        let row = sqlx::query(
            r#"
            SELECT document
            FROM session_versions
            WHERE session_id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => {
                let mut session: CoordinationSession = serde_json::from_value(r.get("document"))?;
                session.context = self.list_session_messages(id).await?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn append_report(&self, report: &SessionReport) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO session_reports (session_id, outcome, document, finished_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (session_id) DO NOTHING
            "#,
        )
        .bind(report.session_id)
        .bind(report.outcome.as_str())
        .bind(serde_json::to_value(report)?)
        .bind(report.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_report(&self, session_id: SessionId) -> Result<Option<SessionReport>> {
        let row = sqlx::query("SELECT document FROM session_reports WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| serde_json::from_value(r.get("document")).map_err(Into::into))
            .transpose()
    }

    async fn append_task(&self, session_id: SessionId, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_versions (task_id, session_id, status, document, recorded_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(task.id)
        .bind(session_id)
        .bind(task.status.as_str())
        .bind(serde_json::to_value(task)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let row = sqlx::query(
            r#"
            SELECT document
            FROM task_versions
            WHERE task_id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| serde_json::from_value(r.get("document")).map_err(Into::into))
            .transpose()
    }

    async fn append_message(&self, message: &Message) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, session_id, correlation_id, message_type, from_agent_id, to_agent_id, document, sent_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(message.id)
        .bind(message.session_id)
        .bind(message.correlation_id)
        .bind(message.message_type.as_str())
        .bind(message.from_agent_id)
        .bind(message.to_agent_id)
        .bind(serde_json::to_value(message)?)
        .bind(message.sent_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT document FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| serde_json::from_value(r.get("document")).map_err(Into::into))
            .transpose()
    }

    async fn list_session_messages(&self, session_id: SessionId) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT document
            FROM messages
            WHERE session_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| serde_json::from_value(r.get("document")).map_err(Into::into))
            .collect()
    }
}
