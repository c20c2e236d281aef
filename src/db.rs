use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::{
    Chunk, DocumentMetadata, IndexedChunk, IngestManifest, IngestStatus, Message, Role,
};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        Self::connect(&config.sqlite_dsn()).await
    }

    pub async fn connect(dsn: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(dsn)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open sqlite database {dsn}"))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                api_key TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE INDEX IF NOT EXISTS messages_by_user ON messages (user_id, created_at, id);

            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                page_index INTEGER NOT NULL,
                chunk_index INTEGER NOT NULL,
                source_tag TEXT NOT NULL,
                start_offset INTEGER NOT NULL,
                title TEXT NOT NULL,
                author TEXT NOT NULL,
                creation_date TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS manifests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pdf_hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                page_count INTEGER NOT NULL,
                chunk_count INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ingest_jobs (
                job_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                stage TEXT NOT NULL,
                message TEXT,
                page_count INTEGER NOT NULL,
                chunk_count INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Creates a user and returns its freshly generated 32-character API key.
    pub async fn register_api_key(&self) -> Result<String> {
        let api_key = Uuid::new_v4().simple().to_string();
        sqlx::query("INSERT INTO users (api_key, created_at) VALUES (?, ?)")
            .bind(&api_key)
            .bind(timestamp(&Utc::now()))
            .execute(&self.pool)
            .await?;

        Ok(api_key)
    }

    pub async fn list_api_keys(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT api_key FROM users ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|r| r.get("api_key")).collect())
    }

    pub async fn resolve_user(&self, api_key: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT id FROM users WHERE api_key = ?")
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i64, _>("id")))
    }

    pub async fn load_history(&self, user_id: i64) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT role, content, created_at
            FROM messages
            WHERE user_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut history = Vec::with_capacity(rows.len());
        for row in rows {
            let role: String = row.get("role");
            let Some(role) = Role::from_db(&role) else {
                tracing::warn!(user_id, role, "skipping message with unknown role");
                continue;
            };
            history.push(Message {
                role,
                content: row.get("content"),
                created_at: parse_timestamp(&row.get::<String, _>("created_at")),
            });
        }

        Ok(history)
    }

    /// Appends all messages in one transaction, in the given order.
    pub async fn append_messages(&self, user_id: i64, messages: &[Message]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for message in messages {
            sqlx::query(
                "INSERT INTO messages (user_id, role, content, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(user_id)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(timestamp(&message.created_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Swaps the chunk table contents for `chunks`.
    pub async fn replace_chunks(&self, chunks: &[IndexedChunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        for indexed in chunks {
            let chunk = &indexed.chunk;
            sqlx::query(
                r#"
                INSERT INTO chunks (id, content, page_index, chunk_index, source_tag, start_offset, title, author, creation_date)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&indexed.id)
            .bind(&chunk.content)
            .bind(chunk.page_index as i64)
            .bind(chunk.chunk_index as i64)
            .bind(&chunk.source_tag)
            .bind(chunk.start_offset as i64)
            .bind(&chunk.metadata.title)
            .bind(&chunk.metadata.author)
            .bind(&chunk.metadata.creation_date)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Returns chunks in the order of `ids`; unknown ids are skipped.
    pub async fn get_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<IndexedChunk>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, content, page_index, chunk_index, source_tag, start_offset, title, author, creation_date FROM chunks WHERE id IN (",
        );
        let mut separated = qb.separated(",");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows: Vec<SqliteRow> = qb.build().fetch_all(&self.pool).await?;
        let mut by_id: HashMap<String, IndexedChunk> = rows
            .into_iter()
            .map(row_to_chunk)
            .map(|chunk| (chunk.id.clone(), chunk))
            .collect();

        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    pub async fn record_manifest(&self, manifest: &IngestManifest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO manifests (pdf_hash, created_at, page_count, chunk_count)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&manifest.pdf_hash)
        .bind(timestamp(&manifest.created_at))
        .bind(manifest.page_count)
        .bind(manifest.chunk_count)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn latest_manifest(&self) -> Result<Option<IngestManifest>> {
        let row = sqlx::query(
            r#"
            SELECT pdf_hash, created_at, page_count, chunk_count
            FROM manifests
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| IngestManifest {
            pdf_hash: r.get("pdf_hash"),
            created_at: parse_timestamp(&r.get::<String, _>("created_at")),
            page_count: r.get("page_count"),
            chunk_count: r.get("chunk_count"),
        }))
    }

    pub async fn upsert_ingest_status(&self, status: &IngestStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_jobs (job_id, status, stage, message, page_count, chunk_count, started_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                status = excluded.status,
                stage = excluded.stage,
                message = excluded.message,
                page_count = excluded.page_count,
                chunk_count = excluded.chunk_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&status.job_id)
        .bind(&status.status)
        .bind(&status.stage)
        .bind(&status.message)
        .bind(status.page_count)
        .bind(status.chunk_count)
        .bind(timestamp(&status.started_at))
        .bind(timestamp(&status.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_ingest_status(&self, job_id: &str) -> Result<Option<IngestStatus>> {
        let row = sqlx::query(
            r#"
            SELECT job_id, status, stage, message, page_count, chunk_count, started_at, updated_at
            FROM ingest_jobs
            WHERE job_id = ?
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| IngestStatus {
            job_id: r.get("job_id"),
            status: r.get("status"),
            stage: r.get("stage"),
            message: r.get("message"),
            page_count: r.get("page_count"),
            chunk_count: r.get("chunk_count"),
            started_at: parse_timestamp(&r.get::<String, _>("started_at")),
            updated_at: parse_timestamp(&r.get::<String, _>("updated_at")),
        }))
    }
}

/// Fixed-width UTC timestamps so `ORDER BY created_at` sorts chronologically.
fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_chunk(row: SqliteRow) -> IndexedChunk {
    IndexedChunk {
        id: row.get("id"),
        chunk: Chunk {
            content: row.get("content"),
            page_index: row.get::<i64, _>("page_index") as usize,
            chunk_index: row.get::<i64, _>("chunk_index") as usize,
            source_tag: row.get("source_tag"),
            start_offset: row.get::<i64, _>("start_offset") as usize,
            metadata: DocumentMetadata {
                title: row.get("title"),
                author: row.get("author"),
                creation_date: row.get("creation_date"),
            },
        },
    }
}
