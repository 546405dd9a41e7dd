use showplay_core::CacheError;
use showplay_io::fseq::{Compression, SequenceWriter};
use showplay_io::{FrameCache, FrameCacheOptions, FramePriority, FrameSelector, SequenceError};
use std::path::PathBuf;

const CHANNELS: usize = 16;
const FRAMES: usize = 12;

fn pattern() -> Vec<Vec<u8>> {
    (0..FRAMES)
        .map(|f| (0..CHANNELS).map(|c| (f * 5 + c) as u8).collect())
        .collect()
}

fn zstd_sequence(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("show.fseq");
    SequenceWriter::new(CHANNELS as u32, 50)
        .with_compression(Compression::Zstd)
        .with_frames_per_block(6)
        .write(&path, &pattern())
        .unwrap();
    path
}

#[tokio::test]
async fn test_get_frame_by_number_and_time() {
    let dir = tempfile::tempdir().unwrap();
    let path = zstd_sequence(&dir);
    let cache = FrameCache::new(FrameCacheOptions::default());
    let expected = pattern();

    let frame = cache.get_frame(&path, FrameSelector::Frame(7), 0).await.unwrap();
    assert_eq!(frame.frame(), 7);
    assert_eq!(frame.len(), CHANNELS);
    assert_eq!(&frame[..], &expected[7][..]);
    frame.release();

    // 125ms into a 50ms-step sequence is frame 2
    let frame = cache.get_frame(&path, FrameSelector::Time(125), 1).await.unwrap();
    assert_eq!(frame.frame(), 2);
    assert_eq!(frame.time(), 100);
    assert_eq!(frame.as_ref(), &expected[2][..]);
}

#[tokio::test]
async fn test_out_of_range_frame() {
    let dir = tempfile::tempdir().unwrap();
    let path = zstd_sequence(&dir);
    let cache = FrameCache::new(FrameCacheOptions::default());

    let err = cache
        .get_frame(&path, FrameSelector::Frame(FRAMES as u32), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, SequenceError::FrameOutOfRange { .. }));

    let err = cache
        .get_frame(&path, FrameSelector::Time(10_000), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, SequenceError::FrameOutOfRange { frame: 200, .. }));
}

#[tokio::test]
async fn test_frame_requests_wait_for_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = zstd_sequence(&dir);
    let cache = FrameCache::new(FrameCacheOptions::default());

    // Header unknown: the frame request is parked
    assert!(!cache.prefetch_seq_frames(&path, 0..FRAMES as u32, FramePriority::at(0), 0, None));
    assert_eq!(cache.stats().deferred, 1);

    cache.dispatch(0);
    cache.wait_for_fetches().await;
    assert_eq!(cache.stats().headers.ready, 1);

    // Replayed: both chunks queued, then decoded
    cache.dispatch(1);
    assert_eq!(cache.stats().deferred, 0);
    cache.wait_for_fetches().await;
    let stats = cache.stats();
    assert_eq!(stats.chunks.ready, 2);
    assert_eq!(stats.chunks.realized_cost, (FRAMES * CHANNELS) as u64);

    // Everything needed is resident, so this is a hit
    let before = cache.stats().chunks.reference.hits;
    let frame = cache.get_frame(&path, FrameSelector::Frame(11), 2).await.unwrap();
    assert_eq!(&frame[..], &pattern()[11][..]);
    assert_eq!(cache.stats().chunks.reference.hits, before + 1);
}

#[tokio::test]
async fn test_time_prefetch_only_touches_needed_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let path = zstd_sequence(&dir);
    let cache = FrameCache::new(FrameCacheOptions::default());
    cache.load_header(&path, 0).await.unwrap();

    // Frames 6..8 all live in the second chunk
    assert!(cache.prefetch_seq_times(&path, 300..400, FramePriority::at(0), 0, None));
    cache.dispatch(0);
    cache.wait_for_fetches().await;
    assert_eq!(cache.stats().chunks.ready, 1);
}

#[tokio::test]
async fn test_budget_keeps_one_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let path = zstd_sequence(&dir);
    let chunk_bytes = (6 * CHANNELS) as u64;
    let cache = FrameCache::new(FrameCacheOptions {
        chunk_budget: chunk_bytes,
        ..Default::default()
    });
    cache.load_header(&path, 0).await.unwrap();

    cache.prefetch_seq_frames(&path, 0..6, FramePriority::at(10), 0, None);
    cache.dispatch(0);
    cache.wait_for_fetches().await;
    assert_eq!(cache.stats().chunks.ready, 1);

    // Moving on: the second chunk is needed sooner than the stale first one
    cache.prefetch_seq_frames(&path, 6..12, FramePriority::at(20), 15, None);
    cache.dispatch(15);
    cache.wait_for_fetches().await;
    cache.dispatch(16);
    cache.wait_for_fetches().await;

    let stats = cache.stats();
    assert!(stats.chunks.realized_cost <= chunk_bytes);
    let frame = cache.get_frame(&path, FrameSelector::Frame(9), 17).await.unwrap();
    assert_eq!(&frame[..], &pattern()[9][..]);
    assert!(cache.stats().pool.releases >= 1);
}

#[tokio::test]
async fn test_missing_file_error_is_memoized() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.fseq");
    let cache = FrameCache::new(FrameCacheOptions::default());

    let err = cache.get_frame(&path, FrameSelector::Frame(0), 0).await.unwrap_err();
    let SequenceError::Cache(cache_err) = &err else {
        panic!("unexpected error {:?}", err);
    };
    assert!(cache_err.is_fetch_error());
    assert!(matches!(
        cache_err.fetch_source::<SequenceError>(),
        Some(SequenceError::Io(_))
    ));

    // Frame requests against a failed header are not parked
    assert!(!cache.prefetch_seq_frames(&path, 0..4, FramePriority::at(0), 1, None));
    assert_eq!(cache.stats().deferred, 0);
}

#[tokio::test]
async fn test_shutdown_rejects_new_requests() {
    let dir = tempfile::tempdir().unwrap();
    let path = zstd_sequence(&dir);
    let cache = FrameCache::new(FrameCacheOptions::default());
    cache.get_frame(&path, FrameSelector::Frame(0), 0).await.unwrap();

    cache.shutdown().await;
    let stats = cache.stats();
    assert_eq!(stats.chunks.item_count(), 0);
    assert_eq!(stats.pool.retained_bytes, 0);

    let err = cache.get_frame(&path, FrameSelector::Frame(0), 1).await.unwrap_err();
    assert!(matches!(err, SequenceError::Cache(CacheError::ShutDown)));
}
