use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use tracing::info;

use crate::db::models::*;
use crate::fingerprint::ContentId;

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Initialize database connection and create tables
    pub async fn new(database_path: &str) -> Result<Self, sqlx::Error> {
        let database_url = format!("sqlite://{}", database_path);
        info!("Connecting to {}", database_url);
        let options = SqliteConnectOptions::from_str(&database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        let db = Database { pool };
        db.create_tables().await?;
        Ok(db)
    }

    /// Create all necessary tables
    async fn create_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS media (
                content_id TEXT PRIMARY KEY,
                playback_speed REAL NOT NULL DEFAULT 1.0,
                volume REAL NOT NULL DEFAULT 1.0,
                muted BOOLEAN NOT NULL DEFAULT FALSE,
                seek_position REAL NOT NULL DEFAULT 0.0,
                duration REAL,
                complete BOOLEAN NOT NULL DEFAULT FALSE,
                last_accessed TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audio_tracks (
                id TEXT PRIMARY KEY,
                content_id TEXT NOT NULL,
                stream_index INTEGER NOT NULL,
                volume REAL NOT NULL DEFAULT 1.0,
                muted BOOLEAN NOT NULL DEFAULT FALSE,
                FOREIGN KEY (content_id) REFERENCES media (content_id) ON DELETE CASCADE,
                UNIQUE(content_id, stream_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subtitles (
                id TEXT PRIMARY KEY,
                content_id TEXT NOT NULL,
                name TEXT NOT NULL,
                language TEXT,
                size REAL NOT NULL DEFAULT 1.0,
                color TEXT NOT NULL DEFAULT '#FFFFFF',
                timing_adjustment REAL NOT NULL DEFAULT 0.0,
                file_path TEXT NOT NULL,
                FOREIGN KEY (content_id) REFERENCES media (content_id) ON DELETE CASCADE,
                UNIQUE(content_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_media_last_accessed ON media (last_accessed, content_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_audio_tracks_content_id ON audio_tracks (content_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_subtitles_content_id ON subtitles (content_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Insert a new media record
    pub async fn insert_media(&self, media: &DbMediaRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO media (
                content_id, playback_speed, volume, muted, seek_position,
                duration, complete, last_accessed
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(media.content_id.as_str())
        .bind(media.playback_speed)
        .bind(media.volume)
        .bind(media.muted)
        .bind(media.seek_position)
        .bind(media.duration)
        .bind(media.complete)
        .bind(timestamp_to_sql(&media.last_accessed))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a media record by content id
    pub async fn get_media(
        &self,
        content_id: &ContentId,
    ) -> Result<Option<DbMediaRecord>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM media WHERE content_id = ?")
            .bind(content_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| media_from_row(&row)).transpose()
    }

    /// Refresh last_accessed on a media record
    pub async fn update_last_accessed(
        &self,
        content_id: &ContentId,
        last_accessed: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("UPDATE media SET last_accessed = ? WHERE content_id = ?")
            .bind(timestamp_to_sql(&last_accessed))
            .bind(content_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn update_duration(
        &self,
        content_id: &ContentId,
        duration: Option<f64>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("UPDATE media SET duration = ? WHERE content_id = ?")
            .bind(duration)
            .bind(content_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn update_complete(
        &self,
        content_id: &ContentId,
        complete: bool,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("UPDATE media SET complete = ? WHERE content_id = ?")
            .bind(complete)
            .bind(content_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Persist playback fields of a media record
    pub async fn update_playback_state(
        &self,
        content_id: &ContentId,
        snapshot: &PlaybackSnapshot,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE media
            SET playback_speed = ?, volume = ?, muted = ?, seek_position = ?
            WHERE content_id = ?
            "#,
        )
        .bind(snapshot.playback_speed)
        .bind(snapshot.volume)
        .bind(snapshot.muted)
        .bind(snapshot.seek_position)
        .bind(content_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// List media ordered by (last_accessed, content_id) ascending,
    /// starting strictly after `after` when given
    pub async fn list_least_recently_accessed(
        &self,
        after: Option<&LruCursor>,
        limit: u32,
    ) -> Result<Vec<LruCursor>, sqlx::Error> {
        let rows = match after {
            Some(cursor) => {
                let ts = timestamp_to_sql(&cursor.last_accessed);
                sqlx::query(
                    r#"
                    SELECT content_id, last_accessed FROM media
                    WHERE last_accessed > ? OR (last_accessed = ? AND content_id > ?)
                    ORDER BY last_accessed ASC, content_id ASC
                    LIMIT ?
                    "#,
                )
                .bind(&ts)
                .bind(&ts)
                .bind(cursor.content_id.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT content_id, last_accessed FROM media
                    ORDER BY last_accessed ASC, content_id ASC
                    LIMIT ?
                    "#,
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter()
            .map(|row| {
                Ok(LruCursor {
                    content_id: content_id_from_row(row, "content_id")?,
                    last_accessed: timestamp_from_row(row, "last_accessed")?,
                })
            })
            .collect()
    }

    /// Start a transaction that deletes a media record and, via
    /// FOREIGN KEY ON DELETE CASCADE, its audio tracks and subtitles.
    ///
    /// The caller decides whether to commit.
    pub async fn begin_delete_media(
        &self,
        content_id: &ContentId,
    ) -> Result<(Transaction<'static, Sqlite>, u64), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM media WHERE content_id = ?")
            .bind(content_id.as_str())
            .execute(&mut *tx)
            .await?;
        Ok((tx, result.rows_affected()))
    }

    /// Insert a new audio track
    pub async fn insert_audio_track(&self, track: &DbAudioTrack) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO audio_tracks (
                id, content_id, stream_index, volume, muted
            ) VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&track.id)
        .bind(track.content_id.as_str())
        .bind(track.stream_index)
        .bind(track.volume)
        .bind(track.muted)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get audio tracks for a media record, ordered by stream index
    pub async fn get_audio_tracks(
        &self,
        content_id: &ContentId,
    ) -> Result<Vec<DbAudioTrack>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM audio_tracks WHERE content_id = ? ORDER BY stream_index ASC",
        )
        .bind(content_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut tracks = Vec::new();
        for row in rows {
            tracks.push(DbAudioTrack {
                id: row.get("id"),
                content_id: content_id_from_row(&row, "content_id")?,
                stream_index: row.get("stream_index"),
                volume: row.get("volume"),
                muted: row.get("muted"),
            });
        }

        Ok(tracks)
    }

    pub async fn update_audio_track_state(
        &self,
        track_id: &str,
        volume: f32,
        muted: bool,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("UPDATE audio_tracks SET volume = ?, muted = ? WHERE id = ?")
            .bind(volume)
            .bind(muted)
            .bind(track_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Remove every audio track row of a media record
    pub async fn delete_audio_tracks(&self, content_id: &ContentId) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM audio_tracks WHERE content_id = ?")
            .bind(content_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Insert or replace a subtitle by (content_id, name)
    pub async fn upsert_subtitle(&self, subtitle: &DbSubtitle) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO subtitles (
                id, content_id, name, language, size, color, timing_adjustment, file_path
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(content_id, name) DO UPDATE SET
                language = excluded.language,
                file_path = excluded.file_path
            "#,
        )
        .bind(&subtitle.id)
        .bind(subtitle.content_id.as_str())
        .bind(&subtitle.name)
        .bind(&subtitle.language)
        .bind(subtitle.size)
        .bind(&subtitle.color)
        .bind(subtitle.timing_adjustment)
        .bind(&subtitle.file_path)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_subtitles(
        &self,
        content_id: &ContentId,
    ) -> Result<Vec<DbSubtitle>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM subtitles WHERE content_id = ? ORDER BY name")
            .bind(content_id.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(subtitle_from_row).collect()
    }

    pub async fn get_subtitle(
        &self,
        content_id: &ContentId,
        name: &str,
    ) -> Result<Option<DbSubtitle>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM subtitles WHERE content_id = ? AND name = ?")
            .bind(content_id.as_str())
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| subtitle_from_row(&row)).transpose()
    }
}

fn media_from_row(row: &SqliteRow) -> Result<DbMediaRecord, sqlx::Error> {
    Ok(DbMediaRecord {
        content_id: content_id_from_row(row, "content_id")?,
        playback_speed: row.get("playback_speed"),
        volume: row.get("volume"),
        muted: row.get("muted"),
        seek_position: row.get("seek_position"),
        duration: row.get("duration"),
        complete: row.get("complete"),
        last_accessed: timestamp_from_row(row, "last_accessed")?,
    })
}

fn subtitle_from_row(row: &SqliteRow) -> Result<DbSubtitle, sqlx::Error> {
    Ok(DbSubtitle {
        id: row.get("id"),
        content_id: content_id_from_row(row, "content_id")?,
        name: row.get("name"),
        language: row.get("language"),
        size: row.get("size"),
        color: row.get("color"),
        timing_adjustment: row.get("timing_adjustment"),
        file_path: row.get("file_path"),
    })
}

fn content_id_from_row(row: &SqliteRow, column: &str) -> Result<ContentId, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    ContentId::from_hex(raw.clone())
        .ok_or_else(|| sqlx::Error::Decode(format!("invalid content id '{}'", raw).into()))
}

fn timestamp_from_row(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}
