mod support;

use chrono::Utc;
use std::time::Duration;

use crate::support::IngestFixture;
use tandem::fingerprint::ContentId;
use tandem::test_support::{MockDecoder, MOCK_ASSET_BYTES};

async fn ingest(fixture: &IngestFixture, name: &str) -> ContentId {
    let path = fixture.write_media(name, name);
    let outcome = fixture.pipeline.ingest(&path).await.unwrap();
    // Keep last_accessed strictly increasing between entries
    tokio::time::sleep(Duration::from_millis(3)).await;
    outcome.handle().content_id.clone()
}

#[tokio::test]
async fn test_least_recently_accessed_is_evicted_first() {
    let budget = (MOCK_ASSET_BYTES * 2 + MOCK_ASSET_BYTES / 2) as u64;
    let fixture = IngestFixture::with_budget(MockDecoder::with_audio_streams(1), budget).await;

    let a = ingest(&fixture, "a.mp4").await;
    let b = ingest(&fixture, "b.mp4").await;

    // Re-opening a makes b the oldest entry
    let hit = ingest(&fixture, "a.mp4").await;
    assert_eq!(hit, a);

    let c = ingest(&fixture, "c.mp4").await;

    assert!(fixture.store.lookup(&b).await.unwrap().is_none());
    assert!(!fixture.store.entry_dir(&b).exists());
    assert!(fixture.store.lookup(&a).await.unwrap().is_some());
    assert!(fixture.store.lookup(&c).await.unwrap().is_some());

    let size = fixture.pipeline.governor().cache_size().await.unwrap();
    assert!(size <= budget);
}

#[tokio::test]
async fn test_budget_enforced_after_large_ingest() {
    let decoder = MockDecoder::with_audio_streams(2);
    let fixture = IngestFixture::with_budget(decoder, 10_000).await;

    let small = ingest(&fixture, "small.mp4").await;
    fixture.decoder.set_asset_bytes(4_000);
    let large = ingest(&fixture, "large.mp4").await;

    // 2 * 1024 + 2 * 4000 is over budget, so the older entry goes
    assert!(fixture.store.lookup(&small).await.unwrap().is_none());
    assert!(fixture.store.lookup(&large).await.unwrap().is_some());
    assert_eq!(fixture.pipeline.governor().cache_size().await.unwrap(), 8_000);
}

#[tokio::test]
async fn test_within_budget_evicts_nothing() {
    let fixture = IngestFixture::new(MockDecoder::with_audio_streams(1)).await;
    ingest(&fixture, "a.mp4").await;
    ingest(&fixture, "b.mp4").await;

    let report = fixture
        .pipeline
        .governor()
        .enforce_budget(u64::MAX)
        .await
        .unwrap();
    assert!(report.evicted.is_empty());
    assert!(!report.exhausted);
    assert_eq!(report.initial_bytes, (MOCK_ASSET_BYTES * 2) as u64);
}

#[tokio::test]
async fn test_entry_being_ingested_is_never_evicted() {
    let fixture = IngestFixture::new(MockDecoder::with_audio_streams(1)).await;
    let a = ingest(&fixture, "a.mp4").await;
    let b = ingest(&fixture, "b.mp4").await;

    let guard = fixture.locks.acquire(&a).await;
    let report = fixture.pipeline.governor().enforce_budget(0).await.unwrap();
    drop(guard);

    assert_eq!(report.skipped_in_progress, vec![a.clone()]);
    assert_eq!(report.evicted, vec![b.clone()]);
    assert!(report.exhausted);
    assert_eq!(report.final_bytes, MOCK_ASSET_BYTES as u64);

    assert!(fixture.store.lookup(&a).await.unwrap().is_some());
    assert!(fixture.store.lookup(&b).await.unwrap().is_none());
}

#[tokio::test]
async fn test_eviction_cascades_tracks_and_subtitles() {
    let fixture = IngestFixture::new(MockDecoder::with_audio_streams(2)).await;
    let a = ingest(&fixture, "a.mp4").await;
    fixture
        .store
        .save_subtitle(&a, "English", Some("en"), b"1\n00:00:01,000 --> 00:00:02,000\nHello\n")
        .await
        .unwrap();

    let report = fixture.pipeline.governor().enforce_budget(0).await.unwrap();
    assert_eq!(report.evicted, vec![a.clone()]);
    assert!(report.partial_failures.is_empty());
    assert_eq!(report.final_bytes, 0);

    assert!(fixture.store.tracks(&a).await.unwrap().is_empty());
    assert!(fixture.store.subtitles(&a).await.unwrap().is_empty());
    assert!(!fixture.store.entry_dir(&a).exists());
}

#[tokio::test]
async fn test_evicted_entry_is_reingested_from_scratch() {
    let fixture = IngestFixture::new(MockDecoder::with_audio_streams(1)).await;
    let a = ingest(&fixture, "a.mp4").await;
    fixture.pipeline.governor().enforce_budget(0).await.unwrap();

    let path = fixture.media_dir.join("a.mp4");
    let outcome = fixture.pipeline.ingest(&path).await.unwrap();
    assert!(!outcome.is_hit());
    assert_eq!(outcome.handle().content_id, a);
    assert_eq!(fixture.decoder.demux_calls(), 2);
}

#[tokio::test]
async fn test_partial_eviction_is_reported_and_pass_continues() {
    let fixture = IngestFixture::new(MockDecoder::with_audio_streams(1)).await;
    let a = ingest(&fixture, "a.mp4").await;
    let b = ingest(&fixture, "b.mp4").await;

    // The entry directory of a cannot be removed as a directory
    std::fs::remove_dir_all(fixture.store.entry_dir(&a)).unwrap();
    std::fs::write(fixture.store.entry_dir(&a), vec![0u8; 10]).unwrap();

    let report = fixture.pipeline.governor().enforce_budget(0).await.unwrap();
    assert_eq!(report.partial_failures, vec![a.clone()]);
    assert_eq!(report.evicted, vec![b.clone()]);
    assert!(report.exhausted);
    assert_eq!(report.final_bytes, 10);

    assert!(fixture.store.lookup(&a).await.unwrap().is_some());
    assert!(fixture.store.lookup(&b).await.unwrap().is_none());
}

#[tokio::test]
async fn test_eviction_pages_past_one_batch_in_lru_order() {
    let fixture = IngestFixture::new(MockDecoder::with_audio_streams(1)).await;
    let base = Utc::now() - chrono::Duration::hours(1);

    let mut by_age = Vec::new();
    for i in 0..60 {
        let path = fixture.write_media(&format!("{}.mp4", i), &format!("entry {}", i));
        let content_id = fixture
            .pipeline
            .ingest(&path)
            .await
            .unwrap()
            .into_handle()
            .content_id;
        fixture
            .store
            .database()
            .update_last_accessed(&content_id, base + chrono::Duration::seconds(i))
            .await
            .unwrap();
        by_age.push(content_id);
    }

    let budget = (MOCK_ASSET_BYTES * 5) as u64;
    let report = fixture
        .pipeline
        .governor()
        .enforce_budget(budget)
        .await
        .unwrap();

    assert_eq!(report.evicted, by_age[..55].to_vec());
    assert!(!report.exhausted);
    assert!(report.partial_failures.is_empty());
    assert_eq!(report.final_bytes, budget);

    for content_id in &by_age[55..] {
        assert!(fixture.store.lookup(content_id).await.unwrap().is_some());
    }
    assert_eq!(
        fixture.store.list_by_least_recently_accessed(100).await.unwrap(),
        by_age[55..].to_vec()
    );
}
