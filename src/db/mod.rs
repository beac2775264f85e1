pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    Row, Sqlite,
    migrate::MigrateDatabase,
    sqlite::{SqlitePool, SqlitePoolOptions},
};
use std::env;

use crate::models::{LedgerEntry, Poll, PollOption, PollStatus};

pub use memory::MemoryRepository;

pub type RepoError = Box<dyn std::error::Error + Send + Sync>;

/// Durable poll store the engine reads through and writes back through. The
/// engine owns the live tallies; this is the system of record behind it.
#[async_trait]
pub trait PollRepository: Send + Sync {
    async fn create_poll(&self, poll: &Poll) -> Result<(), RepoError>;
    async fn get_poll(&self, poll_id: &str) -> Result<Option<Poll>, RepoError>;
    async fn list_active(&self) -> Result<Vec<Poll>, RepoError>;
    /// Idempotent: re-recording an existing (poll, voter) pair is a no-op.
    async fn record_vote(&self, entry: &LedgerEntry) -> Result<(), RepoError>;
    async fn poll_votes(&self, poll_id: &str) -> Result<Vec<LedgerEntry>, RepoError>;
    async fn mark_closed(&self, poll_id: &str) -> Result<(), RepoError>;
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new() -> Result<Self, RepoError> {
        // Get database URL from environment or use a default
        let db_url = env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:pollstream.db".to_string());

        // Create database if it doesn't exist
        if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            Sqlite::create_database(&db_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(pool: &SqlitePool) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS polls (
                id TEXT PRIMARY KEY,
                creator_id TEXT NOT NULL,
                question TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                ends_at TEXT
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS poll_options (
                id TEXT PRIMARY KEY,
                poll_id TEXT NOT NULL,
                text TEXT NOT NULL,
                position INTEGER NOT NULL,
                FOREIGN KEY (poll_id) REFERENCES polls(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS votes (
                poll_id TEXT NOT NULL,
                voter_id TEXT NOT NULL,
                option_id TEXT NOT NULL,
                accepted_at TEXT NOT NULL,
                PRIMARY KEY (poll_id, voter_id),
                FOREIGN KEY (poll_id) REFERENCES polls(id) ON DELETE CASCADE,
                FOREIGN KEY (option_id) REFERENCES poll_options(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn load_options(&self, poll_id: &str) -> Result<Vec<PollOption>, RepoError> {
        let options = sqlx::query(
            r#"
            SELECT id, text, position
            FROM poll_options
            WHERE poll_id = ?
            ORDER BY position
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| PollOption {
            id: row.get::<String, _>("id"),
            text: row.get::<String, _>("text"),
            vote_count: 0,
        })
        .collect();

        Ok(options)
    }

    fn poll_from_row(row: &sqlx::sqlite::SqliteRow, options: Vec<PollOption>) -> Result<Poll, RepoError> {
        let created_at_str = row.get::<String, _>("created_at");
        let ends_at_str: Option<String> = row.get("ends_at");
        let status_str = row.get::<String, _>("status");

        let created_at = DateTime::parse_from_rfc3339(&created_at_str)
            .map_err(|e| format!("Failed to parse created_at: {}", e))?
            .with_timezone(&Utc);

        let ends_at = match ends_at_str {
            Some(s) => Some(
                DateTime::parse_from_rfc3339(&s)
                    .map_err(|e| format!("Failed to parse ends_at: {}", e))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        let status = match status_str.as_str() {
            "active" => PollStatus::Active,
            "closed" => PollStatus::Closed,
            other => return Err(format!("Unknown poll status: {}", other).into()),
        };

        Ok(Poll {
            id: row.get::<String, _>("id"),
            creator_id: row.get::<String, _>("creator_id"),
            question: row.get::<String, _>("question"),
            options,
            status,
            created_at,
            ends_at,
            revision: 0,
        })
    }
}

#[async_trait]
impl PollRepository for Database {
    async fn create_poll(&self, poll: &Poll) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO polls (id, creator_id, question, status, created_at, ends_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&poll.id)
        .bind(&poll.creator_id)
        .bind(&poll.question)
        .bind(match poll.status {
            PollStatus::Active => "active",
            PollStatus::Closed => "closed",
        })
        .bind(poll.created_at.to_rfc3339())
        .bind(poll.ends_at.map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        for (i, option) in poll.options.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO poll_options (id, poll_id, text, position)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(&option.id)
            .bind(&poll.id)
            .bind(&option.text)
            .bind(i as i64)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn get_poll(&self, poll_id: &str) -> Result<Option<Poll>, RepoError> {
        let row = sqlx::query(
            r#"
            SELECT id, creator_id, question, status, created_at, ends_at
            FROM polls
            WHERE id = ?
            "#,
        )
        .bind(poll_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let options = self.load_options(poll_id).await?;
        Ok(Some(Self::poll_from_row(&row, options)?))
    }

    async fn list_active(&self) -> Result<Vec<Poll>, RepoError> {
        let rows = sqlx::query(
            r#"
            SELECT id, creator_id, question, status, created_at, ends_at
            FROM polls
            WHERE status = 'active'
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut polls = Vec::with_capacity(rows.len());
        for row in rows {
            let poll_id = row.get::<String, _>("id");
            let options = self.load_options(&poll_id).await?;
            polls.push(Self::poll_from_row(&row, options)?);
        }

        Ok(polls)
    }

    async fn record_vote(&self, entry: &LedgerEntry) -> Result<(), RepoError> {
        // The primary key on (poll_id, voter_id) backs the one-vote-per-voter
        // invariant; a retried insert is ignored rather than duplicated.
        sqlx::query(
            r#"
            INSERT INTO votes (poll_id, voter_id, option_id, accepted_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(poll_id, voter_id) DO NOTHING
            "#,
        )
        .bind(&entry.poll_id)
        .bind(&entry.voter_id)
        .bind(&entry.option_id)
        .bind(entry.accepted_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn poll_votes(&self, poll_id: &str) -> Result<Vec<LedgerEntry>, RepoError> {
        let entries = sqlx::query(
            r#"
            SELECT poll_id, voter_id, option_id, accepted_at
            FROM votes
            WHERE poll_id = ?
            ORDER BY accepted_at
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| -> Result<LedgerEntry, RepoError> {
            Ok(LedgerEntry {
                poll_id: row.get::<String, _>("poll_id"),
                voter_id: row.get::<String, _>("voter_id"),
                option_id: row.get::<String, _>("option_id"),
                accepted_at: DateTime::parse_from_rfc3339(&row.get::<String, _>("accepted_at"))
                    .map_err(|e| format!("Failed to parse accepted_at: {}", e))?
                    .with_timezone(&Utc),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    async fn mark_closed(&self, poll_id: &str) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            UPDATE polls
            SET status = 'closed'
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(poll_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
