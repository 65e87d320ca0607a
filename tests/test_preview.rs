mod support;

use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::support::tracing_init;
use tandem::decode::DecodeJobs;
use tandem::preview::{
    PreviewError, PreviewOptions, PreviewTile, ScrubPreviewGenerator, PREVIEW_CHUNK_SIZE,
};
use tandem::test_support::MockDecoder;

fn generator(decoder: &Arc<MockDecoder>) -> ScrubPreviewGenerator {
    tracing_init();
    ScrubPreviewGenerator::new(decoder.clone(), DecodeJobs::new())
}

fn options(max_tiles: u32) -> PreviewOptions {
    PreviewOptions {
        max_tiles,
        ..Default::default()
    }
}

async fn collect(
    generator: &ScrubPreviewGenerator,
    options: PreviewOptions,
) -> Vec<Result<PreviewTile, PreviewError>> {
    generator
        .generate(Path::new("/media/movie.mp4"), options)
        .collect()
        .await
}

#[tokio::test]
async fn test_tiles_evenly_spaced_up_to_cap() {
    let decoder = Arc::new(MockDecoder::with_audio_streams(1));
    let generator = generator(&decoder);

    let tiles: Vec<PreviewTile> = collect(&generator, options(10))
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(tiles.len(), 10);
    for (i, tile) in tiles.iter().enumerate() {
        assert_eq!(tile.index, i as u32);
        assert!((tile.timestamp - i as f64 * 12.0).abs() < 1e-9);
        assert_eq!((tile.width, tile.height), (160, 90));
        assert_eq!(&tile.bytes[..2], &[0xFF, 0xD8]);
    }
    assert_eq!(decoder.frame_calls(), 10);
}

#[tokio::test]
async fn test_one_tile_per_second_for_short_media() {
    let decoder = Arc::new(MockDecoder::with_audio_streams(1));
    decoder.set_duration(Some(3.5));
    let generator = generator(&decoder);

    let tiles = collect(&generator, options(100)).await;
    assert_eq!(tiles.len(), 3);
    assert!(tiles.iter().all(Result::is_ok));
}

#[tokio::test]
async fn test_captures_run_in_bounded_chunks() {
    let decoder = Arc::new(MockDecoder::with_audio_streams(1));
    decoder.set_frame_delay(Duration::from_millis(5));
    let generator = generator(&decoder);

    let tiles = collect(&generator, options(30)).await;
    assert_eq!(tiles.len(), 30);
    assert!(decoder.max_frames_in_flight() <= PREVIEW_CHUNK_SIZE);
    assert!(decoder.max_frames_in_flight() > 1);
}

#[tokio::test]
async fn test_nothing_runs_until_polled() {
    let decoder = Arc::new(MockDecoder::with_audio_streams(1));
    let generator = generator(&decoder);

    let mut tiles = generator.generate(Path::new("/media/movie.mp4"), options(5));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(decoder.probe_calls(), 0);

    assert!(tiles.next().await.unwrap().is_ok());
    assert_eq!(decoder.probe_calls(), 1);
}

#[tokio::test]
async fn test_missing_duration_ends_with_error() {
    let decoder = Arc::new(MockDecoder::with_audio_streams(1));
    decoder.set_duration(None);
    let generator = generator(&decoder);

    let items = collect(&generator, options(10)).await;
    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Err(PreviewError::NoDuration)));
    assert_eq!(decoder.frame_calls(), 0);
}

#[tokio::test]
async fn test_sequence_times_out_as_a_whole() {
    let decoder = Arc::new(MockDecoder::with_audio_streams(1));
    decoder.set_frame_delay(Duration::from_secs(30));
    let generator = generator(&decoder);

    let items = tokio::time::timeout(
        Duration::from_secs(5),
        collect(
            &generator,
            PreviewOptions {
                timeout: Duration::from_millis(100),
                ..options(10)
            },
        ),
    )
    .await
    .expect("deadline was not enforced");

    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Err(PreviewError::Timeout(_))));
    assert!(decoder.frame_calls() <= PREVIEW_CHUNK_SIZE);
}

#[tokio::test]
async fn test_invalid_options_rejected() {
    let decoder = Arc::new(MockDecoder::with_audio_streams(1));
    let generator = generator(&decoder);

    for bad in [
        PreviewOptions {
            quality: 0.0,
            ..Default::default()
        },
        PreviewOptions {
            tile_width: 0,
            ..Default::default()
        },
        options(0),
    ] {
        let items = collect(&generator, bad).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(PreviewError::InvalidOptions(_))));
    }
    assert_eq!(decoder.probe_calls(), 0);
}
