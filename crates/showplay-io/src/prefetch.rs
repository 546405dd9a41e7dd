//! Frame prefetch cache
//!
//! Serves "frame N (or time T) of file F" on top of two budget caches: one for
//! parsed headers (cheap, one cost unit each) and one for decoded chunks
//! (charged by decompressed size). Decoded chunk buffers come from a shared
//! [`BufferPool`] and go back to it when the chunk leaves the cache.
//!
//! The owner places interest with the `prefetch_seq_*` calls and then runs
//! [`FrameCache::dispatch`] once per batch. Frame and time requests that arrive
//! before the file's header is known are parked and replayed on a later
//! dispatch.

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::fs::File;
use std::ops::{Deref, Range};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use showplay_core::{
    deadline_order, AcquireRequest, BoxError, BudgetCache, BudgetCacheOptions, BufferPool,
    BufferPoolConfig, BufferPoolStats, CacheHandle, CacheSource, CacheStats, Millis, PrefetchSpec,
};

use crate::error::{Result, SequenceError};
use crate::fseq::block_index::{BlockIndex, ChunkEntry, DEFAULT_PSEUDO_CHUNK_BYTES};
use crate::fseq::header::{Compression, SequenceHeader};
use crate::fseq::reader::{decompress_chunk, read_chunk_raw};

/// Urgency of a prefetch: when the data is needed, then stream rank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePriority {
    pub needed_at: Millis,
    /// Lower ranks win ties on `needed_at`
    pub rank: u8,
}

impl FramePriority {
    pub fn at(needed_at: Millis) -> Self {
        Self { needed_at, rank: 0 }
    }

    fn compare(&self, other: &Self, now: Millis) -> Ordering {
        deadline_order(self.needed_at, other.needed_at, now).then(self.rank.cmp(&other.rank))
    }
}

/// Parsed header and chunk index of one file
#[derive(Debug)]
pub struct SequenceFile {
    pub path: PathBuf,
    pub header: SequenceHeader,
    pub index: BlockIndex,
}

fn boxed(err: SequenceError) -> BoxError {
    Box::new(err)
}

async fn run_blocking<T, F>(f: F) -> std::result::Result<T, BoxError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Box::new(e) as BoxError)?
        .map_err(boxed)
}

struct HeaderSource {
    pseudo_chunk_bytes: usize,
}

impl CacheSource for HeaderSource {
    type Key = PathBuf;
    type Value = SequenceFile;
    type Priority = FramePriority;

    fn fetch(&self, path: PathBuf) -> BoxFuture<'static, std::result::Result<SequenceFile, BoxError>> {
        let pseudo_chunk_bytes = self.pseudo_chunk_bytes;
        run_blocking(move || {
            let header = SequenceHeader::read_from(&path)?;
            let index = BlockIndex::from_header(&header, pseudo_chunk_bytes)?;
            debug!(
                "Loaded header of {}: {} frames, {} chunks",
                path.display(),
                header.frame_count,
                index.len()
            );
            Ok(SequenceFile {
                path,
                header,
                index,
            })
        })
        .boxed()
    }

    fn predict_cost(&self, _path: &PathBuf) -> u64 {
        1
    }

    fn cost(&self, _file: &SequenceFile) -> u64 {
        1
    }

    fn identity(&self, path: &PathBuf) -> String {
        path.to_string_lossy().into_owned()
    }

    fn compare_priority(&self, a: &FramePriority, b: &FramePriority, now: Millis) -> Ordering {
        a.compare(b, now)
    }
}

#[derive(Debug, Clone)]
struct ChunkKey {
    path: PathBuf,
    chunk: ChunkEntry,
}

/// Decompressed frames of one chunk
#[derive(Debug)]
pub struct DecodedChunk {
    data: Vec<u8>,
    start_frame: u32,
    frame_size: usize,
}

impl DecodedChunk {
    fn frame_range(&self, frame: u32) -> Range<usize> {
        let at = (frame - self.start_frame) as usize * self.frame_size;
        at..at + self.frame_size
    }
}

fn load_chunk(pool: &BufferPool, path: &Path, chunk: &ChunkEntry, frame_size: usize) -> Result<DecodedChunk> {
    let mut file = File::open(path)?;
    let mut raw = pool.acquire_with_capacity(chunk.file_length as usize);
    if let Err(err) = read_chunk_raw(&mut file, chunk, &mut raw) {
        pool.release(raw);
        return Err(err);
    }

    let data = if chunk.compression == Compression::None {
        raw
    } else {
        let mut out = pool.acquire_with_capacity(chunk.decompressed_length);
        let decoded = decompress_chunk(chunk, &raw, &mut out);
        pool.release(raw);
        if let Err(err) = decoded {
            pool.release(out);
            return Err(err);
        }
        out
    };
    trace!(
        "Decoded chunk {} of {} ({} -> {} bytes)",
        chunk.index,
        path.display(),
        chunk.file_length,
        data.len()
    );
    Ok(DecodedChunk {
        data,
        start_frame: chunk.start_frame,
        frame_size,
    })
}

struct ChunkSource {
    pool: Arc<BufferPool>,
}

impl CacheSource for ChunkSource {
    type Key = ChunkKey;
    type Value = DecodedChunk;
    type Priority = FramePriority;

    fn fetch(&self, key: ChunkKey) -> BoxFuture<'static, std::result::Result<DecodedChunk, BoxError>> {
        let pool = Arc::clone(&self.pool);
        run_blocking(move || {
            let frame_count = key.chunk.frame_count().max(1) as usize;
            let frame_size = key.chunk.decompressed_length / frame_count;
            load_chunk(&pool, &key.path, &key.chunk, frame_size)
        })
        .boxed()
    }

    fn predict_cost(&self, key: &ChunkKey) -> u64 {
        key.chunk.decompressed_length as u64
    }

    fn cost(&self, value: &DecodedChunk) -> u64 {
        value.data.len() as u64
    }

    fn identity(&self, key: &ChunkKey) -> String {
        let c = &key.chunk;
        format!(
            "{}#{}@{}+{}:{}:{}",
            key.path.to_string_lossy(),
            c.index,
            c.file_offset,
            c.file_length,
            c.compression.code(),
            c.decompressed_length
        )
    }

    fn compare_priority(&self, a: &FramePriority, b: &FramePriority, now: Millis) -> Ordering {
        a.compare(b, now)
    }

    fn dispose(&self, _key: &ChunkKey, value: DecodedChunk) {
        self.pool.release(value.data);
    }
}

/// Which frame [`FrameCache::get_frame`] should return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSelector {
    Frame(u32),
    /// Milliseconds from the start of the sequence
    Time(Millis),
}

/// One frame's bytes, pinned in the chunk cache until dropped
pub struct FrameReference {
    chunk: CacheHandle<ChunkSource>,
    range: Range<usize>,
    frame: u32,
    time: Millis,
}

impl FrameReference {
    pub fn frame(&self) -> u32 {
        self.frame
    }

    /// Start time of the frame within the sequence
    pub fn time(&self) -> Millis {
        self.time
    }

    pub fn data(&self) -> &[u8] {
        &self.chunk.data[self.range.clone()]
    }

    /// Unpin the chunk. Equivalent to dropping the reference.
    pub fn release(self) {}
}

impl Deref for FrameReference {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data()
    }
}

impl AsRef<[u8]> for FrameReference {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}

impl std::fmt::Debug for FrameReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReference")
            .field("chunk", &self.chunk.id())
            .field("frame", &self.frame)
            .field("len", &self.range.len())
            .finish()
    }
}

/// Limits for a [`FrameCache`]
#[derive(Debug, Clone)]
pub struct FrameCacheOptions {
    /// Number of file headers kept
    pub header_budget: u64,
    pub header_concurrency: usize,
    /// Decoded bytes kept
    pub chunk_budget: u64,
    pub chunk_concurrency: usize,
    /// Items untouched for this long are dropped by [`FrameCache::dispatch`]
    pub ageout_ms: Millis,
    /// Chunk size for uncompressed files
    pub pseudo_chunk_bytes: usize,
    pub pool: BufferPoolConfig,
}

impl Default for FrameCacheOptions {
    fn default() -> Self {
        Self {
            header_budget: 64,
            header_concurrency: 4,
            chunk_budget: 256 * 1024 * 1024,
            chunk_concurrency: 2,
            ageout_ms: 60_000,
            pseudo_chunk_bytes: DEFAULT_PSEUDO_CHUNK_BYTES,
            pool: BufferPoolConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
enum RequestSpan {
    Frames(Range<u32>),
    Times(Range<Millis>),
}

#[derive(Debug, Clone)]
struct DeferredRequest {
    path: PathBuf,
    span: RequestSpan,
    priority: FramePriority,
    expiry: Option<Millis>,
    requested_at: Millis,
}

/// Snapshot of both sub-caches and the buffer pool
#[derive(Debug, Clone)]
pub struct FrameCacheStats {
    pub headers: CacheStats,
    pub chunks: CacheStats,
    pub pool: BufferPoolStats,
    /// Frame/time requests waiting for a header
    pub deferred: usize,
}

/// Decoded frame cache over sequence files
pub struct FrameCache {
    headers: BudgetCache<HeaderSource>,
    chunks: BudgetCache<ChunkSource>,
    pool: Arc<BufferPool>,
    deferred: Mutex<Vec<DeferredRequest>>,
    options: FrameCacheOptions,
}

impl FrameCache {
    pub fn new(options: FrameCacheOptions) -> Self {
        let pool = Arc::new(BufferPool::new(options.pool.clone()));
        let headers = BudgetCache::new(
            HeaderSource {
                pseudo_chunk_bytes: options.pseudo_chunk_bytes,
            },
            BudgetCacheOptions {
                budget: options.header_budget,
                max_concurrency: options.header_concurrency,
            },
        );
        let chunks = BudgetCache::new(
            ChunkSource {
                pool: Arc::clone(&pool),
            },
            BudgetCacheOptions {
                budget: options.chunk_budget,
                max_concurrency: options.chunk_concurrency,
            },
        );
        info!(
            "Frame cache: {} headers, {} MiB of chunks, {} concurrent decodes",
            options.header_budget,
            options.chunk_budget / (1024 * 1024),
            options.chunk_concurrency
        );
        Self {
            headers,
            chunks,
            pool,
            deferred: Mutex::new(Vec::new()),
            options,
        }
    }

    pub fn options(&self) -> &FrameCacheOptions {
        &self.options
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    fn cutoff(&self, now: Millis) -> Millis {
        now.saturating_sub(self.options.ageout_ms)
    }

    /// Ask for the header of `path`.
    pub fn prefetch_seq_metadata(&self, path: &Path, priority: FramePriority, now: Millis) {
        self.headers.prefetch(path.to_path_buf(), priority, now, None);
    }

    /// Ask for the chunks holding `frames`. The first frame is needed at
    /// `priority.needed_at`, later chunks correspondingly later.
    ///
    /// Returns false if the header is not loaded yet; the request is then
    /// replayed by a later [`dispatch`](Self::dispatch).
    pub fn prefetch_seq_frames(
        &self,
        path: &Path,
        frames: Range<u32>,
        priority: FramePriority,
        now: Millis,
        expiry: Option<Millis>,
    ) -> bool {
        self.prefetch_span(path, RequestSpan::Frames(frames), priority, now, expiry)
    }

    /// Ask for the chunks covering sequence times `times` (milliseconds).
    pub fn prefetch_seq_times(
        &self,
        path: &Path,
        times: Range<Millis>,
        priority: FramePriority,
        now: Millis,
        expiry: Option<Millis>,
    ) -> bool {
        self.prefetch_span(path, RequestSpan::Times(times), priority, now, expiry)
    }

    fn prefetch_span(
        &self,
        path: &Path,
        span: RequestSpan,
        priority: FramePriority,
        now: Millis,
        expiry: Option<Millis>,
    ) -> bool {
        let path = path.to_path_buf();
        // Looked up before prefetching so a failed header stays failed; only
        // prefetch_seq_metadata retries it.
        match self.headers.reference(&path, now) {
            Some(Ok(file)) => {
                self.headers.prefetch(path.clone(), priority, now, None);
                self.prefetch_chunks(&file, &span, priority, now, expiry);
                true
            }
            Some(Err(err)) => {
                debug!("Not prefetching frames of {}: {}", path.display(), err);
                false
            }
            None => {
                self.headers.prefetch(path.clone(), priority, now, None);
                trace!("Deferring {:?} of {} until its header loads", span, path.display());
                self.deferred.lock().push(DeferredRequest {
                    path,
                    span,
                    priority,
                    expiry,
                    requested_at: now,
                });
                false
            }
        }
    }

    fn prefetch_chunks(
        &self,
        file: &SequenceFile,
        span: &RequestSpan,
        priority: FramePriority,
        now: Millis,
        expiry: Option<Millis>,
    ) {
        let header = &file.header;
        let frames = match span {
            RequestSpan::Frames(frames) => frames.start..frames.end.min(header.frame_count),
            RequestSpan::Times(times) => {
                if header.step_ms == 0 {
                    return;
                }
                let step = header.step_ms as Millis;
                let first = times.start / step;
                let last = times.end.div_ceil(step).min(header.frame_count as Millis);
                first.min(last) as u32..last as u32
            }
        };

        for chunk in file.index.chunks_for_frames(frames.start, frames.end) {
            let lead = chunk.start_frame.saturating_sub(frames.start);
            let chunk_priority = FramePriority {
                needed_at: priority.needed_at + header.frame_time(lead),
                rank: priority.rank,
            };
            self.chunks.prefetch(
                ChunkKey {
                    path: file.path.clone(),
                    chunk: *chunk,
                },
                chunk_priority,
                now,
                expiry,
            );
        }
    }

    fn replay_deferred(&self, now: Millis) {
        let pending = std::mem::take(&mut *self.deferred.lock());
        if pending.is_empty() {
            return;
        }
        let cutoff = self.cutoff(now);
        let mut still_waiting = Vec::new();
        for request in pending {
            match self.headers.reference(&request.path, now) {
                Some(Ok(file)) => {
                    self.prefetch_chunks(&file, &request.span, request.priority, now, request.expiry)
                }
                Some(Err(err)) => warn!(
                    "Dropping frame request for {}: {}",
                    request.path.display(),
                    err
                ),
                None if request.requested_at < cutoff => {
                    debug!("Deferred request for {} aged out", request.path.display())
                }
                None => {
                    // Keep the header wanted while requests wait on it
                    self.headers
                        .prefetch(request.path.clone(), request.priority, now, None);
                    still_waiting.push(request);
                }
            }
        }
        self.deferred.lock().extend(still_waiting);
    }

    /// Replay parked requests, then run cleanup and dispatch on both caches
    /// with the configured age-out.
    pub fn dispatch(&self, now: Millis) {
        self.dispatch_with_ageout(now, self.options.ageout_ms);
    }

    pub fn dispatch_with_ageout(&self, now: Millis, ageout_ms: Millis) {
        self.replay_deferred(now);
        let cutoff = now.saturating_sub(ageout_ms);
        self.headers.cleanup_and_dispatch(now, cutoff);
        self.chunks.cleanup_and_dispatch(now, cutoff);
    }

    async fn acquire_header(&self, path: &Path, now: Millis) -> Result<CacheHandle<HeaderSource>> {
        let key = path.to_path_buf();
        if let Some(found) = self.headers.reference(&key, now) {
            return Ok(found?);
        }
        // A miss runs a pass on its own so a lone request never stalls
        let priority = FramePriority::at(now);
        self.headers.prefetch(key.clone(), priority, now, None);
        self.headers.cleanup_and_dispatch(now, self.cutoff(now));
        let handle = self
            .headers
            .acquire(AcquireRequest {
                key,
                now,
                prefetch: Some(PrefetchSpec {
                    priority,
                    expiry: None,
                }),
            })
            .await?;
        Ok(handle)
    }

    /// Header of `path`, loading it if needed
    pub async fn load_header(&self, path: &Path, now: Millis) -> Result<SequenceHeader> {
        let file = self.acquire_header(path, now).await?;
        Ok(file.header.clone())
    }

    /// Bytes of one frame, decoding its chunk on first access.
    pub async fn get_frame(
        &self,
        path: &Path,
        selector: FrameSelector,
        now: Millis,
    ) -> Result<FrameReference> {
        let (key, frame, time) = {
            let file = self.acquire_header(path, now).await?;
            let header = &file.header;
            let out_of_range = |frame: u64| SequenceError::FrameOutOfRange {
                frame,
                frame_count: header.frame_count,
            };
            let frame = match selector {
                FrameSelector::Frame(frame) => frame,
                FrameSelector::Time(ms) => header
                    .frame_at_time(ms)
                    .ok_or_else(|| out_of_range(ms / header.step_ms.max(1) as Millis))?,
            };
            let chunk = file
                .index
                .find_chunk(frame)
                .ok_or_else(|| out_of_range(frame as u64))?;
            let key = ChunkKey {
                path: file.path.clone(),
                chunk: *chunk,
            };
            (key, frame, header.frame_time(frame))
        };

        let priority = FramePriority::at(now);
        let handle = match self.chunks.reference(&key, now) {
            Some(found) => found?,
            None => {
                self.chunks.prefetch(key.clone(), priority, now, None);
                if !self.chunks.check(&key, now) {
                    self.chunks.cleanup_and_dispatch(now, self.cutoff(now));
                }
                self.chunks
                    .acquire(AcquireRequest {
                        key,
                        now,
                        prefetch: Some(PrefetchSpec {
                            priority,
                            expiry: None,
                        }),
                    })
                    .await?
            }
        };

        let range = handle.frame_range(frame);
        if range.end > handle.data.len() {
            return Err(SequenceError::truncated(format!(
                "frame {} beyond decoded chunk of {} bytes",
                frame,
                handle.data.len()
            )));
        }
        Ok(FrameReference {
            chunk: handle,
            range,
            frame,
            time,
        })
    }

    /// Drop a file's header and all of its decoded chunks not currently
    /// referenced, e.g. after the file changed on disk.
    pub fn invalidate(&self, path: &Path) {
        let key = path.to_path_buf();
        if let Some(Ok(file)) = self.headers.reference(&key, 0) {
            for chunk in file.index.chunks() {
                self.chunks.remove(&ChunkKey {
                    path: key.clone(),
                    chunk: *chunk,
                });
            }
        }
        self.headers.remove(&key);
        self.deferred.lock().retain(|r| r.path != key);
    }

    /// Wait until no header or chunk fetch is in flight
    pub async fn wait_for_fetches(&self) {
        self.headers.wait_for_fetches().await;
        self.chunks.wait_for_fetches().await;
    }

    pub fn stats(&self) -> FrameCacheStats {
        FrameCacheStats {
            headers: self.headers.stats(),
            chunks: self.chunks.stats(),
            pool: self.pool.stats(),
            deferred: self.deferred.lock().len(),
        }
    }

    /// Abort all fetches, drop everything, and empty the buffer pool.
    pub async fn shutdown(&self) {
        self.deferred.lock().clear();
        self.chunks.shutdown().await;
        self.headers.shutdown().await;
        self.pool.clear();
        info!("Frame cache shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_prefers_sooner_then_rank() {
        let a = FramePriority { needed_at: 100, rank: 1 };
        let b = FramePriority { needed_at: 200, rank: 0 };
        assert_eq!(a.compare(&b, 50), Ordering::Less);
        let c = FramePriority { needed_at: 100, rank: 0 };
        assert_eq!(a.compare(&c, 50), Ordering::Greater);
        // Past deadlines sort after pending ones
        assert_eq!(a.compare(&b, 150), Ordering::Greater);
    }

    #[test]
    fn test_chunk_identity_includes_layout() {
        let source = ChunkSource {
            pool: Arc::new(BufferPool::new(BufferPoolConfig::default())),
        };
        let chunk = ChunkEntry {
            index: 2,
            start_frame: 20,
            end_frame: 30,
            file_offset: 512,
            file_length: 77,
            compression: Compression::Zstd,
            decompressed_length: 600,
        };
        let key = ChunkKey {
            path: PathBuf::from("/shows/a.fseq"),
            chunk,
        };
        assert_eq!(source.identity(&key), "/shows/a.fseq#2@512+77:1:600");
        assert_eq!(source.predict_cost(&key), 600);
    }
}
