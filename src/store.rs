use crate::db::{
    Database, DbAudioTrack, DbMediaRecord, DbSubtitle, LruCursor, PlaybackSnapshot,
};
use crate::fingerprint::ContentId;
use chrono::Utc;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

/// Extension of demuxed audio assets (PCM in a WAV container)
pub const ASSET_EXTENSION: &str = "wav";

const SUBTITLE_DIR: &str = "subtitles";

/// Which half of an eviction was left behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionRemnant {
    /// Rows were kept, the directory may be partially removed
    Rows,
    /// Directory is gone, the rows could not be deleted
    Directory,
}

impl fmt::Display for EvictionRemnant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionRemnant::Rows => f.write_str("database rows remain"),
            EvictionRemnant::Directory => f.write_str("directory removed but rows remain"),
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Media record already exists: {0}")]
    DuplicateKey(ContentId),
    #[error("Media record not found: {0}")]
    NotFound(ContentId),
    #[error("Audio track not found: {0}")]
    TrackNotFound(String),
    #[error("Asset missing on disk: {}", .0.display())]
    MissingAsset(PathBuf),
    #[error("Partial eviction of {content_id} ({remnant}): {detail}")]
    PartialEviction {
        content_id: ContentId,
        remnant: EvictionRemnant,
        detail: String,
    },
}

/// Content-addressed asset store.
///
/// Layout under `root`:
///
/// ```text
/// <root>/<content_id>/<stream_index>.wav
/// <root>/<content_id>/subtitles/<subtitle_id>.<ext>
/// ```
///
/// A directory and its rows form one cache entry; `delete` removes both.
#[derive(Debug, Clone)]
pub struct AssetStore {
    database: Database,
    root: PathBuf,
}

impl AssetStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub async fn new(database: Database, root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(AssetStore { database, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn entry_dir(&self, content_id: &ContentId) -> PathBuf {
        self.root.join(content_id.as_str())
    }

    /// Deterministic asset path for one audio stream of an entry
    pub fn asset_path(&self, content_id: &ContentId, stream_index: u32) -> PathBuf {
        self.entry_dir(content_id)
            .join(format!("{}.{}", stream_index, ASSET_EXTENSION))
    }

    pub async fn ensure_entry_dir(&self, content_id: &ContentId) -> Result<PathBuf, StoreError> {
        let dir = self.entry_dir(content_id);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    pub async fn lookup(&self, content_id: &ContentId) -> Result<Option<DbMediaRecord>, StoreError> {
        Ok(self.database.get_media(content_id).await?)
    }

    /// Insert a fresh media record.
    ///
    /// Fails with `DuplicateKey` if one exists; callers check `lookup` first.
    pub async fn insert(&self, content_id: &ContentId) -> Result<DbMediaRecord, StoreError> {
        let record = DbMediaRecord::new(content_id.clone());
        match self.database.insert_media(&record).await {
            Ok(()) => {
                debug!("AssetStore: Inserted media record {}", content_id);
                Ok(record)
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::DuplicateKey(content_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record a demuxed audio stream. The asset must already be on disk.
    pub async fn insert_track(
        &self,
        content_id: &ContentId,
        stream_index: u32,
    ) -> Result<DbAudioTrack, StoreError> {
        let asset = self.asset_path(content_id, stream_index);
        if !fs::try_exists(&asset).await? {
            return Err(StoreError::MissingAsset(asset));
        }

        let track = DbAudioTrack::new(content_id.clone(), stream_index);
        self.database.insert_audio_track(&track).await?;
        Ok(track)
    }

    /// Audio tracks of an entry, ordered by stream index
    pub async fn tracks(&self, content_id: &ContentId) -> Result<Vec<DbAudioTrack>, StoreError> {
        Ok(self.database.get_audio_tracks(content_id).await?)
    }

    /// Refresh last_accessed to now
    pub async fn touch(&self, content_id: &ContentId) -> Result<(), StoreError> {
        let updated = self
            .database
            .update_last_accessed(content_id, Utc::now())
            .await?;
        require_row(updated, content_id)
    }

    pub async fn set_duration(
        &self,
        content_id: &ContentId,
        duration: Option<f64>,
    ) -> Result<(), StoreError> {
        let updated = self.database.update_duration(content_id, duration).await?;
        require_row(updated, content_id)
    }

    pub async fn mark_complete(&self, content_id: &ContentId) -> Result<(), StoreError> {
        let updated = self.database.update_complete(content_id, true).await?;
        require_row(updated, content_id)
    }

    /// Drop every track row and asset file of an entry and flag it incomplete,
    /// keeping the media record and its playback state.
    pub async fn reset_tracks(&self, content_id: &ContentId) -> Result<(), StoreError> {
        self.database.update_complete(content_id, false).await?;
        let tracks = self.database.get_audio_tracks(content_id).await?;
        self.database.delete_audio_tracks(content_id).await?;

        for track in tracks {
            remove_file_if_present(&self.asset_path(content_id, track.stream_index)).await?;
        }
        Ok(())
    }

    pub async fn save_playback_state(
        &self,
        content_id: &ContentId,
        snapshot: &PlaybackSnapshot,
    ) -> Result<(), StoreError> {
        let updated = self
            .database
            .update_playback_state(content_id, snapshot)
            .await?;
        require_row(updated, content_id)
    }

    pub async fn save_track_state(
        &self,
        track_id: &str,
        volume: f32,
        muted: bool,
    ) -> Result<(), StoreError> {
        let updated = self
            .database
            .update_audio_track_state(track_id, volume, muted)
            .await?;
        if updated == 0 {
            return Err(StoreError::TrackNotFound(track_id.to_string()));
        }
        Ok(())
    }

    /// Content ids ordered oldest-accessed first, ties broken by content id
    pub async fn list_by_least_recently_accessed(
        &self,
        limit: u32,
    ) -> Result<Vec<ContentId>, StoreError> {
        Ok(self
            .list_least_recently_accessed_after(None, limit)
            .await?
            .into_iter()
            .map(|entry| entry.content_id)
            .collect())
    }

    /// Continue the least-recently-accessed scan strictly after `cursor`
    pub async fn list_least_recently_accessed_after(
        &self,
        cursor: Option<&LruCursor>,
        limit: u32,
    ) -> Result<Vec<LruCursor>, StoreError> {
        Ok(self
            .database
            .list_least_recently_accessed(cursor, limit)
            .await?)
    }

    /// Delete a whole cache entry: media row, cascaded track/subtitle rows and
    /// the entry directory.
    ///
    /// Rows are deleted inside a transaction that only commits once the
    /// directory is gone. A failure after one side changed is reported as
    /// `PartialEviction`.
    pub async fn delete(&self, content_id: &ContentId) -> Result<(), StoreError> {
        let (tx, deleted_rows) = self.database.begin_delete_media(content_id).await?;
        let dir = self.entry_dir(content_id);

        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("AssetStore: No directory for {}", content_id);
            }
            Err(e) => {
                let still_present = fs::try_exists(&dir).await.unwrap_or(true);
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(
                        "AssetStore: Rollback failed for {}: {}",
                        content_id, rollback_err
                    );
                }
                return Err(StoreError::PartialEviction {
                    content_id: content_id.clone(),
                    remnant: EvictionRemnant::Rows,
                    detail: format!(
                        "failed to remove {} (still present: {}): {}",
                        dir.display(),
                        still_present,
                        e
                    ),
                });
            }
        }

        if let Err(e) = tx.commit().await {
            return Err(StoreError::PartialEviction {
                content_id: content_id.clone(),
                remnant: EvictionRemnant::Directory,
                detail: format!("failed to commit row deletion: {}", e),
            });
        }

        info!(
            "AssetStore: Deleted entry {} ({} media rows)",
            content_id, deleted_rows
        );
        Ok(())
    }

    /// Store a subtitle file for an entry, replacing one with the same name
    pub async fn save_subtitle(
        &self,
        content_id: &ContentId,
        name: &str,
        language: Option<&str>,
        data: &[u8],
    ) -> Result<DbSubtitle, StoreError> {
        if self.database.get_media(content_id).await?.is_none() {
            return Err(StoreError::NotFound(content_id.clone()));
        }

        // Replacing a name keeps its id, and with it the file
        let mut subtitle = match self.database.get_subtitle(content_id, name).await? {
            Some(existing) => existing,
            None => DbSubtitle::new(content_id.clone(), name, language, String::new()),
        };
        subtitle.language = language.map(str::to_string);

        let dir = self.entry_dir(content_id).join(SUBTITLE_DIR);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(subtitle_file_name(&subtitle.id, name));
        fs::write(&path, data).await?;

        subtitle.file_path = path.to_string_lossy().into_owned();
        self.database.upsert_subtitle(&subtitle).await?;

        Ok(self
            .database
            .get_subtitle(content_id, name)
            .await?
            .unwrap_or(subtitle))
    }

    pub async fn subtitles(&self, content_id: &ContentId) -> Result<Vec<DbSubtitle>, StoreError> {
        Ok(self.database.get_subtitles(content_id).await?)
    }

    /// Subtitle metadata plus file contents
    pub async fn subtitle(
        &self,
        content_id: &ContentId,
        name: &str,
    ) -> Result<Option<(DbSubtitle, Vec<u8>)>, StoreError> {
        match self.database.get_subtitle(content_id, name).await? {
            Some(subtitle) => {
                let data = fs::read(&subtitle.file_path).await?;
                Ok(Some((subtitle, data)))
            }
            None => Ok(None),
        }
    }
}

fn require_row(updated: u64, content_id: &ContentId) -> Result<(), StoreError> {
    if updated == 0 {
        Err(StoreError::NotFound(content_id.clone()))
    } else {
        Ok(())
    }
}

async fn remove_file_if_present(path: &Path) -> Result<(), std::io::Error> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// On-disk name of a subtitle: its id, keeping a plain extension from the
/// display name
fn subtitle_file_name(id: &str, name: &str) -> String {
    match Path::new(name).extension().and_then(|ext| ext.to_str()) {
        Some(ext) if !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
            format!("{}.{}", id, ext.to_ascii_lowercase())
        }
        _ => id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (AssetStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let database = Database::new(db_path.to_str().unwrap()).await.unwrap();
        let store = AssetStore::new(database, temp_dir.path().join("files"))
            .await
            .unwrap();
        (store, temp_dir)
    }

    fn id(c: char) -> ContentId {
        ContentId::from_hex(c.to_string().repeat(64)).unwrap()
    }

    #[tokio::test]
    async fn test_insert_then_duplicate() {
        let (store, _dir) = setup().await;
        store.insert(&id('a')).await.unwrap();

        let again = store.insert(&id('a')).await;
        assert!(matches!(again, Err(StoreError::DuplicateKey(_))));
    }

    #[tokio::test]
    async fn test_insert_track_requires_asset() {
        let (store, _dir) = setup().await;
        store.insert(&id('a')).await.unwrap();

        let missing = store.insert_track(&id('a'), 0).await;
        assert!(matches!(missing, Err(StoreError::MissingAsset(_))));

        store.ensure_entry_dir(&id('a')).await.unwrap();
        fs::write(store.asset_path(&id('a'), 0), b"RIFF").await.unwrap();
        let track = store.insert_track(&id('a'), 0).await.unwrap();
        assert_eq!(track.stream_index, 0);
        assert_eq!(store.tracks(&id('a')).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_cascades_rows_and_directory() {
        let (store, _dir) = setup().await;
        store.insert(&id('b')).await.unwrap();
        store.ensure_entry_dir(&id('b')).await.unwrap();
        fs::write(store.asset_path(&id('b'), 0), b"RIFF").await.unwrap();
        store.insert_track(&id('b'), 0).await.unwrap();
        store
            .save_subtitle(&id('b'), "en.srt", Some("en"), b"1\n")
            .await
            .unwrap();

        store.delete(&id('b')).await.unwrap();

        assert!(store.lookup(&id('b')).await.unwrap().is_none());
        assert!(store.tracks(&id('b')).await.unwrap().is_empty());
        assert!(store.subtitles(&id('b')).await.unwrap().is_empty());
        assert!(!store.entry_dir(&id('b')).exists());
    }

    #[tokio::test]
    async fn test_list_oldest_first_with_ties_by_id() {
        let (store, _dir) = setup().await;
        let base = Utc::now() - chrono::Duration::seconds(100);
        let accessed = [('d', 10), ('b', 10), ('f', 30), ('c', 0), ('a', 10), ('e', 20)];
        for (c, offset) in accessed {
            store.insert(&id(c)).await.unwrap();
            store
                .database()
                .update_last_accessed(&id(c), base + chrono::Duration::seconds(offset))
                .await
                .unwrap();
        }

        let oldest = store.list_by_least_recently_accessed(4).await.unwrap();
        assert_eq!(oldest, vec![id('c'), id('a'), id('b'), id('d')]);

        let all = store.list_by_least_recently_accessed(10).await.unwrap();
        assert_eq!(
            all,
            vec![id('c'), id('a'), id('b'), id('d'), id('e'), id('f')]
        );
    }

    #[tokio::test]
    async fn test_undeletable_directory_keeps_rows() {
        let (store, _dir) = setup().await;
        store.insert(&id('g')).await.unwrap();
        store.ensure_entry_dir(&id('g')).await.unwrap();
        fs::write(store.asset_path(&id('g'), 0), b"RIFF").await.unwrap();
        store.insert_track(&id('g'), 0).await.unwrap();

        // A plain file where the entry directory should be
        fs::remove_dir_all(store.entry_dir(&id('g'))).await.unwrap();
        fs::write(store.entry_dir(&id('g')), b"in the way").await.unwrap();

        let result = store.delete(&id('g')).await;
        assert!(matches!(
            result,
            Err(StoreError::PartialEviction {
                remnant: EvictionRemnant::Rows,
                ..
            })
        ));
        assert!(store.lookup(&id('g')).await.unwrap().is_some());
        assert_eq!(store.tracks(&id('g')).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reset_tracks_keeps_record() {
        let (store, _dir) = setup().await;
        store.insert(&id('c')).await.unwrap();
        store.ensure_entry_dir(&id('c')).await.unwrap();
        fs::write(store.asset_path(&id('c'), 0), b"RIFF").await.unwrap();
        store.insert_track(&id('c'), 0).await.unwrap();
        store.mark_complete(&id('c')).await.unwrap();

        store.reset_tracks(&id('c')).await.unwrap();

        let record = store.lookup(&id('c')).await.unwrap().unwrap();
        assert!(!record.complete);
        assert!(store.tracks(&id('c')).await.unwrap().is_empty());
        assert!(!store.asset_path(&id('c'), 0).exists());
    }

    #[tokio::test]
    async fn test_subtitle_roundtrip_by_name() {
        let (store, _dir) = setup().await;
        store.insert(&id('d')).await.unwrap();
        store
            .save_subtitle(&id('d'), "../evil.srt", None, b"cue")
            .await
            .unwrap();

        let (subtitle, data) = store.subtitle(&id('d'), "../evil.srt").await.unwrap().unwrap();
        assert_eq!(data, b"cue");
        assert!(Path::new(&subtitle.file_path).starts_with(store.entry_dir(&id('d'))));
    }

    #[tokio::test]
    async fn test_save_state_on_missing_record() {
        let (store, _dir) = setup().await;
        let snapshot = PlaybackSnapshot {
            playback_speed: 1.0,
            volume: 0.5,
            muted: false,
            seek_position: 3.0,
        };
        let result = store.save_playback_state(&id('e'), &snapshot).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_similar_subtitle_names_keep_separate_files() {
        let (store, _dir) = setup().await;
        store.insert(&id('d')).await.unwrap();
        store
            .save_subtitle(&id('d'), "a/b.srt", None, b"first")
            .await
            .unwrap();
        store
            .save_subtitle(&id('d'), "a_b.srt", None, b"second")
            .await
            .unwrap();

        let (_, first) = store.subtitle(&id('d'), "a/b.srt").await.unwrap().unwrap();
        let (_, second) = store.subtitle(&id('d'), "a_b.srt").await.unwrap().unwrap();
        assert_eq!(first, b"first");
        assert_eq!(second, b"second");
    }

    #[tokio::test]
    async fn test_resaving_subtitle_replaces_contents() {
        let (store, _dir) = setup().await;
        store.insert(&id('d')).await.unwrap();
        let original = store
            .save_subtitle(&id('d'), "en.srt", Some("en"), b"old")
            .await
            .unwrap();
        let replaced = store
            .save_subtitle(&id('d'), "en.srt", Some("en-GB"), b"new")
            .await
            .unwrap();

        assert_eq!(replaced.id, original.id);
        assert_eq!(replaced.file_path, original.file_path);
        assert_eq!(replaced.language.as_deref(), Some("en-GB"));
        let (_, data) = store.subtitle(&id('d'), "en.srt").await.unwrap().unwrap();
        assert_eq!(data, b"new");
        assert_eq!(store.subtitles(&id('d')).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_save_track_state_on_missing_track() {
        let (store, _dir) = setup().await;
        store.insert(&id('f')).await.unwrap();
        store.ensure_entry_dir(&id('f')).await.unwrap();
        fs::write(store.asset_path(&id('f'), 0), b"RIFF").await.unwrap();
        let track = store.insert_track(&id('f'), 0).await.unwrap();

        store.save_track_state(&track.id, 0.4, true).await.unwrap();
        store.reset_tracks(&id('f')).await.unwrap();

        let stale = store.save_track_state(&track.id, 0.4, true).await;
        assert!(matches!(stale, Err(StoreError::TrackNotFound(_))));
    }

    #[test]
    fn test_subtitle_file_name() {
        assert_eq!(subtitle_file_name("1234", "a/b.SRT"), "1234.srt");
        assert_eq!(subtitle_file_name("1234", ".."), "1234");
        assert_eq!(subtitle_file_name("1234", "x.s/rt"), "1234");
    }
}
