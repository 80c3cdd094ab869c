use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::info;

use super::JobStorage;
use crate::chapters::Chapter;
use crate::schedule::types::{JobStatus, ProcessingJob};
use crate::web::Pagination;

const TERMINAL_STATUSES: &str = "('complete', 'error', 'cancelled')";

pub struct SqliteJobStorage {
    pool: SqlitePool,
}

/// Fixed-width UTC timestamps so text comparison orders correctly.
fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

impl SqliteJobStorage {
    pub async fn new(database_url: &str) -> Result<Self> {
        info!("Initializing SQLite job storage at {}", database_url);
        let pool = SqlitePool::connect(database_url).await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                video_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                status TEXT NOT NULL,
                progress REAL NOT NULL,
                stage_progress TEXT NOT NULL,
                config TEXT NOT NULL,
                metadata TEXT NOT NULL,
                error_message TEXT,
                start_time TEXT NOT NULL,
                end_time TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_video_status ON jobs (video_id, status)")
            .execute(&pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chapters (
                video_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                title TEXT NOT NULL,
                start_time REAL NOT NULL,
                end_time REAL,
                confidence REAL,
                is_ai_generated INTEGER NOT NULL,
                PRIMARY KEY (video_id, position)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_job(&self, row: SqliteRow) -> Result<ProcessingJob> {
        let status: String = row.try_get("status")?;
        let stage_progress: String = row.try_get("stage_progress")?;
        let config: String = row.try_get("config")?;
        let metadata: String = row.try_get("metadata")?;
        let attempt: i64 = row.try_get("attempt")?;

        Ok(ProcessingJob {
            id: row.try_get("id")?,
            video_id: row.try_get("video_id")?,
            attempt: attempt as u32,
            status: JobStatus::try_from(status)?,
            progress: row.try_get("progress")?,
            stage_progress: serde_json::from_str(&stage_progress)?,
            config: serde_json::from_str(&config)?,
            metadata: serde_json::from_str(&metadata)?,
            error_message: row.try_get("error_message")?,
            start_time: parse_time(row.try_get("start_time")?)?,
            end_time: row
                .try_get::<Option<String>, _>("end_time")?
                .map(|t| parse_time(&t))
                .transpose()?,
            created_at: parse_time(row.try_get("created_at")?)?,
            updated_at: parse_time(row.try_get("updated_at")?)?,
        })
    }

    fn rows_to_jobs(&self, rows: Vec<SqliteRow>) -> Result<Vec<ProcessingJob>> {
        rows.into_iter().map(|row| self.row_to_job(row)).collect()
    }
}

#[async_trait]
impl JobStorage for SqliteJobStorage {
    async fn save_job(&self, job: &ProcessingJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO jobs
            (id, video_id, attempt, status, progress, stage_progress, config, metadata,
             error_message, start_time, end_time, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.video_id)
        .bind(job.attempt as i64)
        .bind(job.status.as_str())
        .bind(job.progress)
        .bind(serde_json::to_string(&job.stage_progress)?)
        .bind(serde_json::to_string(&job.config)?)
        .bind(serde_json::to_string(&job.metadata)?)
        .bind(&job.error_message)
        .bind(format_time(&job.start_time))
        .bind(job.end_time.as_ref().map(format_time))
        .bind(format_time(&job.created_at))
        .bind(format_time(&job.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_job(&self, job_id: &str) -> Result<Option<ProcessingJob>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| self.row_to_job(row)).transpose()
    }

    async fn find_active_job(&self, video_id: &str) -> Result<Option<ProcessingJob>> {
        let query = format!(
            "SELECT * FROM jobs WHERE video_id = ? AND status NOT IN {} ORDER BY created_at DESC LIMIT 1",
            TERMINAL_STATUSES
        );
        let row = sqlx::query(&query)
            .bind(video_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| self.row_to_job(row)).transpose()
    }

    async fn list_jobs(&self, pagination: &Pagination) -> Result<Vec<ProcessingJob>> {
        let pagination = pagination.check();
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC LIMIT ? OFFSET ?")
            .bind(pagination.limit() as i64)
            .bind(pagination.offset() as i64)
            .fetch_all(&self.pool)
            .await?;

        self.rows_to_jobs(rows)
    }

    async fn list_active_jobs(&self) -> Result<Vec<ProcessingJob>> {
        let query = format!(
            "SELECT * FROM jobs WHERE status NOT IN {} ORDER BY created_at ASC",
            TERMINAL_STATUSES
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        self.rows_to_jobs(rows)
    }

    async fn save_chapters(&self, video_id: &str, chapters: &[Chapter]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chapters WHERE video_id = ?")
            .bind(video_id)
            .execute(&mut *tx)
            .await?;

        for chapter in chapters {
            sqlx::query(
                r#"
                INSERT INTO chapters
                (video_id, position, title, start_time, end_time, confidence, is_ai_generated)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(video_id)
            .bind(chapter.order as i64)
            .bind(&chapter.title)
            .bind(chapter.start_time)
            .bind(chapter.end_time)
            .bind(chapter.confidence)
            .bind(chapter.is_ai_generated)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_chapters(&self, video_id: &str) -> Result<Vec<Chapter>> {
        let rows = sqlx::query("SELECT * FROM chapters WHERE video_id = ? ORDER BY position ASC")
            .bind(video_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let position: i64 = row.try_get("position")?;
                Ok(Chapter {
                    title: row.try_get("title")?,
                    start_time: row.try_get("start_time")?,
                    end_time: row.try_get("end_time")?,
                    confidence: row.try_get("confidence")?,
                    is_ai_generated: row.try_get("is_ai_generated")?,
                    order: position as u32,
                })
            })
            .collect()
    }

    async fn cleanup_old(&self, before: DateTime<Utc>) -> Result<u64> {
        let query = format!(
            "DELETE FROM jobs WHERE status IN {} AND updated_at < ?",
            TERMINAL_STATUSES
        );
        let result = sqlx::query(&query)
            .bind(format_time(&before))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
