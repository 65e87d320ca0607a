mod support;

use futures::StreamExt;
use std::sync::Arc;
use tempfile::TempDir;

use crate::support::tracing_init;
use tandem::config::Config;
use tandem::playback::{PlaybackConfig, PlaybackState, Transport};
use tandem::preview::PreviewOptions;
use tandem::test_support::{MockDecoder, MockTimelineBackend};
use tandem::AppContext;

async fn context(temp_dir: &TempDir, backend: &MockTimelineBackend) -> AppContext {
    tracing_init();
    let root = temp_dir.path().to_string_lossy().into_owned();
    let config = Config::from_lookup(|key| match key {
        "TANDEM_DATA_DIR" => Some(root.clone()),
        _ => None,
    })
    .unwrap();

    AppContext::with_backends(
        config,
        Arc::new(MockDecoder::with_audio_streams(2)),
        Arc::new(backend.clone()),
        PlaybackConfig::default(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_open_ingests_and_loads() {
    let temp_dir = TempDir::new().unwrap();
    let backend = MockTimelineBackend::new();
    let context = context(&temp_dir, &backend).await;

    let movie = temp_dir.path().join("movie.webm");
    std::fs::write(&movie, b"not really a webm").unwrap();

    let outcome = context.open(&movie).await.unwrap();
    assert_eq!(outcome.handle().tracks.len(), 2);
    assert!(outcome.handle().tracks[0]
        .asset_path
        .starts_with(&context.config.cache_dir));

    let status = context.playback_handle.status().await.unwrap();
    assert_eq!(status.state, PlaybackState::Loaded(Transport::Paused));
    assert_eq!(status.content_id.as_ref(), Some(&outcome.handle().content_id));

    // Opening the same file again is served from the cache
    let again = context.open(&movie).await.unwrap();
    assert!(again.is_hit());
    assert_eq!(backend.session_count(), 2);
    assert!(backend.timeline(0, 0).unwrap().released);

    let status = context.stop().await.unwrap();
    assert_eq!(status.state, PlaybackState::Idle);
}

#[tokio::test]
async fn test_preview_through_context() {
    let temp_dir = TempDir::new().unwrap();
    let backend = MockTimelineBackend::new();
    let context = context(&temp_dir, &backend).await;

    let tiles: Vec<_> = context
        .preview(
            &temp_dir.path().join("movie.mp4"),
            PreviewOptions {
                max_tiles: 8,
                ..Default::default()
            },
        )
        .collect()
        .await;
    assert_eq!(tiles.len(), 8);
    assert!(tiles.iter().all(Result::is_ok));
}
