use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

/// What the orchestrator needs to know about a video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub id: String,
    /// Seconds.
    pub duration: f64,
    pub source_path: PathBuf,
}

#[async_trait]
pub trait VideoProvider: Send + Sync + 'static {
    async fn get_video(&self, video_id: &str) -> Result<Option<VideoInfo>>;
}

pub struct SqliteVideoCatalog {
    pool: SqlitePool,
}

impl SqliteVideoCatalog {
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS videos (
                id TEXT PRIMARY KEY,
                duration REAL NOT NULL,
                source_path TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub async fn register_video(&self, video: &VideoInfo) -> Result<()> {
        let path = video
            .source_path
            .to_str()
            .ok_or_else(|| anyhow!("source path is not valid UTF-8: {:?}", video.source_path))?;
        sqlx::query("INSERT OR REPLACE INTO videos (id, duration, source_path) VALUES (?, ?, ?)")
            .bind(&video.id)
            .bind(video.duration)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl VideoProvider for SqliteVideoCatalog {
    async fn get_video(&self, video_id: &str) -> Result<Option<VideoInfo>> {
        let row = sqlx::query("SELECT id, duration, source_path FROM videos WHERE id = ?")
            .bind(video_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            let path: String = row.try_get("source_path")?;
            Ok(VideoInfo {
                id: row.try_get("id")?,
                duration: row.try_get("duration")?,
                source_path: PathBuf::from(path),
            })
        })
        .transpose()
    }
}

#[derive(Default)]
pub struct InMemoryVideoCatalog {
    videos: RwLock<HashMap<String, VideoInfo>>,
}

impl InMemoryVideoCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, video: VideoInfo) {
        if let Ok(mut videos) = self.videos.write() {
            videos.insert(video.id.clone(), video);
        }
    }
}

#[async_trait]
impl VideoProvider for InMemoryVideoCatalog {
    async fn get_video(&self, video_id: &str) -> Result<Option<VideoInfo>> {
        let videos = self
            .videos
            .read()
            .map_err(|_| anyhow!("video catalog lock poisoned"))?;
        Ok(videos.get(video_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn test_sqlite_catalog_registers_and_reads() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let catalog = SqliteVideoCatalog::from_pool(pool).await.unwrap();
        let video = VideoInfo {
            id: "video-1".into(),
            duration: 612.5,
            source_path: PathBuf::from("/media/talk.mp4"),
        };
        catalog.register_video(&video).await.unwrap();

        assert_eq!(catalog.get_video("video-1").await.unwrap(), Some(video));
        assert!(catalog.get_video("video-2").await.unwrap().is_none());
    }
}
