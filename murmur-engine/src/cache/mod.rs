//! Decoded-buffer cache
//!
//! Fetches, decodes and caches audio buffers keyed by URL. Concurrent loads
//! of the same URL share one in-flight fetch; completed buffers are LRU
//! evicted down to the configured capacity, skipping buffers still
//! referenced by live source nodes (observable through the `Arc` refcount).
//!
//! Progress model: download maps to 0–80 %, decode to 80–90 %, insertion to
//! 100 %. When the transport cannot report a body length the download range
//! becomes a 6-second sawtooth pulse flagged indeterminate, jumping to the
//! real value on completion.

use crate::audio::{decode_bytes, PcmBuffer};
use crate::error::CacheError;
use crate::events::{EngineEvent, EventBus};
use crate::net::{CancelToken, FetchProgress, Transport};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Load progress report in percent
#[derive(Debug, Clone, Copy)]
pub struct LoadProgress {
    /// Monotone non-decreasing percent in `[0, 100]` when determinate;
    /// a repeating 0→100 pulse otherwise
    pub percent: f64,

    /// False while the transport cannot report a total length
    pub determinate: bool,
}

/// Per-load progress callback
pub type LoadProgressFn = Arc<dyn Fn(LoadProgress) + Send + Sync>;

/// Preload progress callback: `(overall_percent, url, url_percent)`
pub type PreloadProgressFn = Arc<dyn Fn(f64, &str, f64) + Send + Sync>;

/// Options for [`BufferCache::load`]
#[derive(Default, Clone)]
pub struct LoadOptions {
    /// Re-fetch even when the URL is already cached
    pub force: bool,

    pub on_progress: Option<LoadProgressFn>,
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub count: usize,
    pub total_bytes: usize,
    pub total_duration_secs: f64,
    pub max_entries: usize,
    pub pending: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub load_errors: u64,
}

struct CacheEntry {
    buffer: Arc<PcmBuffer>,
    /// LRU position; higher means more recently accessed
    last_access_seq: u64,
    created: tokio::time::Instant,
}

type LoadResult = std::result::Result<Arc<PcmBuffer>, CacheError>;

struct PendingLoad {
    done: broadcast::Sender<LoadResult>,
    cancel: CancelToken,
    /// Progress callbacks from every caller sharing this load
    progress_subs: Arc<Mutex<Vec<LoadProgressFn>>>,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    pending: HashMap<String, PendingLoad>,
}

/// URL-keyed cache of decoded audio buffers
pub struct BufferCache {
    transport: Arc<dyn Transport>,
    inner: Arc<Mutex<CacheInner>>,
    bus: EventBus,
    max_entries: usize,
    working_sample_rate: u32,
    preload_concurrency: usize,
    access_seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    load_errors: AtomicU64,
}

impl BufferCache {
    pub fn new(
        transport: Arc<dyn Transport>,
        bus: EventBus,
        max_entries: usize,
        working_sample_rate: u32,
        preload_concurrency: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            inner: Arc::new(Mutex::new(CacheInner {
                entries: HashMap::new(),
                pending: HashMap::new(),
            })),
            bus,
            max_entries,
            working_sample_rate,
            preload_concurrency,
            access_seq: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            load_errors: AtomicU64::new(0),
        })
    }

    /// Load a buffer, fetching and decoding on a cache miss
    ///
    /// Concurrent calls for the same URL share a single underlying fetch;
    /// every caller's progress callback sees the shared load's progress.
    pub async fn load(self: &Arc<Self>, url: &str, options: LoadOptions) -> LoadResult {
        if !options.force {
            let mut inner = self.inner.lock().unwrap();
            if let Some(entry) = inner.entries.get_mut(url) {
                entry.last_access_seq = self.next_seq();
                let buffer = Arc::clone(&entry.buffer);
                drop(inner);
                self.hits.fetch_add(1, Ordering::Relaxed);
                if let Some(report) = &options.on_progress {
                    report(LoadProgress {
                        percent: 100.0,
                        determinate: true,
                    });
                }
                return Ok(buffer);
            }
        }

        let mut done_rx = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(pending) = inner.pending.get(url) {
                // Join the in-flight load.
                if let Some(report) = options.on_progress.clone() {
                    pending.progress_subs.lock().unwrap().push(report);
                }
                pending.done.subscribe()
            } else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let (done, rx) = broadcast::channel(4);
                let cancel = CancelToken::new();
                let progress_subs = Arc::new(Mutex::new(
                    options.on_progress.clone().into_iter().collect::<Vec<_>>(),
                ));
                inner.pending.insert(
                    url.to_string(),
                    PendingLoad {
                        done: done.clone(),
                        cancel: cancel.clone(),
                        progress_subs: Arc::clone(&progress_subs),
                    },
                );
                drop(inner);

                let cache = Arc::clone(self);
                let url = url.to_string();
                tokio::spawn(async move {
                    let result = cache
                        .run_load(&url, cancel, Arc::clone(&progress_subs))
                        .await;
                    cache.finish_load(&url, &result, &progress_subs);
                    let _ = done.send(result);
                });
                rx
            }
        };

        match done_rx.recv().await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Aborted),
        }
    }

    /// Fetch and decode one URL (the shared part of a de-duplicated load)
    async fn run_load(
        self: &Arc<Self>,
        url: &str,
        cancel: CancelToken,
        progress_subs: Arc<Mutex<Vec<LoadProgressFn>>>,
    ) -> LoadResult {
        let report = {
            let subs = Arc::clone(&progress_subs);
            move |progress: LoadProgress| {
                for sub in subs.lock().unwrap().iter() {
                    sub(progress);
                }
            }
        };

        let started = tokio::time::Instant::now();
        let fetch_report = {
            let report = report.clone();
            Arc::new(move |p: FetchProgress| match p.total {
                Some(total) if total > 0 => report(LoadProgress {
                    percent: (p.bytes as f64 / total as f64) * 80.0,
                    determinate: true,
                }),
                _ => {
                    // Indeterminate length: 6 s sawtooth so something moves.
                    let elapsed = started.elapsed().as_secs_f64();
                    report(LoadProgress {
                        percent: (elapsed % 6.0) / 6.0 * 100.0,
                        determinate: false,
                    });
                }
            })
        };

        let bytes = self
            .transport
            .fetch(url.to_string(), Some(fetch_report), cancel.clone())
            .await?;
        report(LoadProgress {
            percent: 80.0,
            determinate: true,
        });

        if cancel.is_cancelled() {
            return Err(CacheError::Aborted);
        }

        let hint = extension_hint(url);
        let rate = self.working_sample_rate;
        let buffer = tokio::task::spawn_blocking(move || decode_bytes(bytes, hint.as_deref(), rate))
            .await
            .map_err(|e| CacheError::Decode(format!("decode task failed: {e}")))??;
        report(LoadProgress {
            percent: 90.0,
            determinate: true,
        });

        Ok(Arc::new(buffer))
    }

    /// Record a finished load: insert, evict, count, emit
    ///
    /// A successful insert is what completes the progress story at 100 %.
    fn finish_load(
        self: &Arc<Self>,
        url: &str,
        result: &LoadResult,
        progress_subs: &Arc<Mutex<Vec<LoadProgressFn>>>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.remove(url);

        match result {
            Ok(buffer) => {
                inner.entries.insert(
                    url.to_string(),
                    CacheEntry {
                        buffer: Arc::clone(buffer),
                        last_access_seq: self.next_seq(),
                        created: tokio::time::Instant::now(),
                    },
                );
                self.evict_locked(&mut inner);
                drop(inner);

                for sub in progress_subs.lock().unwrap().iter() {
                    sub(LoadProgress {
                        percent: 100.0,
                        determinate: true,
                    });
                }

                debug!(url, frames = buffer.frames(), "buffer cached");
                self.bus.emit_lossy(EngineEvent::BufferLoaded {
                    url: url.to_string(),
                    duration_secs: buffer.duration_secs(),
                    sample_rate: buffer.sample_rate,
                    channels: buffer.source_channels,
                    timestamp: EngineEvent::now(),
                });
            }
            Err(error) => {
                drop(inner);
                self.load_errors.fetch_add(1, Ordering::Relaxed);
                warn!(url, %error, "buffer load failed");
                self.bus.emit_lossy(EngineEvent::BufferError {
                    url: url.to_string(),
                    kind: error.kind().to_string(),
                    message: error.to_string(),
                    timestamp: EngineEvent::now(),
                });
            }
        }
    }

    /// Load several URLs with bounded concurrency
    ///
    /// Individual failures are recorded and omitted from the result; the
    /// batch never aborts siblings. Reports overall percent as the mean of
    /// per-URL percents.
    pub async fn preload(
        self: &Arc<Self>,
        urls: &[String],
        concurrency: Option<usize>,
        on_progress: Option<PreloadProgressFn>,
    ) -> HashMap<String, Arc<PcmBuffer>> {
        if urls.is_empty() {
            return HashMap::new();
        }
        let concurrency = concurrency.unwrap_or(self.preload_concurrency).max(1);
        let total = urls.len() as f64;
        let percents: Arc<Mutex<HashMap<String, f64>>> = Arc::new(Mutex::new(
            urls.iter().map(|u| (u.clone(), 0.0)).collect(),
        ));

        let loaded: Vec<(String, LoadResult)> = futures::stream::iter(urls.iter().cloned())
            .map(|url| {
                let cache = Arc::clone(self);
                let percents = Arc::clone(&percents);
                let on_progress = on_progress.clone();
                async move {
                    let per_url: Option<LoadProgressFn> = on_progress.map(|report| {
                        let url = url.clone();
                        let percents = Arc::clone(&percents);
                        Arc::new(move |p: LoadProgress| {
                            let overall = {
                                let mut map = percents.lock().unwrap();
                                map.insert(url.clone(), p.percent);
                                map.values().sum::<f64>() / total
                            };
                            report(overall, &url, p.percent);
                        }) as LoadProgressFn
                    });
                    let result = cache
                        .load(
                            &url,
                            LoadOptions {
                                force: false,
                                on_progress: per_url,
                            },
                        )
                        .await;
                    (url, result)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut result = HashMap::new();
        for (url, outcome) in loaded {
            match outcome {
                Ok(buffer) => {
                    result.insert(url, buffer);
                }
                Err(error) => {
                    debug!(url, %error, "preload entry skipped");
                }
            }
        }
        info!(
            requested = urls.len(),
            loaded = result.len(),
            "preload finished"
        );
        result
    }

    /// Cached buffer without I/O; bumps recency
    pub fn get(&self, url: &str) -> Option<Arc<PcmBuffer>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get_mut(url) {
            Some(entry) => {
                entry.last_access_seq = self.next_seq();
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.buffer))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Whether the URL is resident (no recency bump)
    pub fn has(&self, url: &str) -> bool {
        self.inner.lock().unwrap().entries.contains_key(url)
    }

    /// Forcibly remove one entry
    pub fn release(&self, url: &str) -> bool {
        self.inner.lock().unwrap().entries.remove(url).is_some()
    }

    /// Cancel an in-flight load; waiters resolve with `Aborted`
    pub fn cancel_load(&self, url: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.pending.get(url) {
            Some(pending) => {
                pending.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop all cached entries, returning how many were removed
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.entries.len();
        inner.entries.clear();
        count
    }

    /// Statistics snapshot
    pub fn info(&self) -> CacheInfo {
        let inner = self.inner.lock().unwrap();
        let total_bytes = inner.entries.values().map(|e| e.buffer.byte_size()).sum();
        let total_duration_secs = inner
            .entries
            .values()
            .map(|e| e.buffer.duration_secs())
            .sum();
        CacheInfo {
            count: inner.entries.len(),
            total_bytes,
            total_duration_secs,
            max_entries: self.max_entries,
            pending: inner.pending.len(),
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            load_errors: self.load_errors.load(Ordering::Relaxed),
        }
    }

    /// Age of an entry, for diagnostics
    pub fn entry_age(&self, url: &str) -> Option<std::time::Duration> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(url)
            .map(|e| e.created.elapsed())
    }

    /// Evict least-recently-used entries until within capacity
    ///
    /// Entries whose buffer is referenced outside the cache (live source
    /// nodes) are pinned and skipped.
    fn evict_locked(&self, inner: &mut CacheInner) {
        while inner.entries.len() > self.max_entries {
            let victim = inner
                .entries
                .iter()
                .filter(|(_, e)| Arc::strong_count(&e.buffer) == 1)
                .min_by_key(|(_, e)| e.last_access_seq)
                .map(|(url, _)| url.clone());

            match victim {
                Some(url) => {
                    debug!(url = %url, "evicting buffer");
                    inner.entries.remove(&url);
                }
                None => {
                    warn!(
                        count = inner.entries.len(),
                        max = self.max_entries,
                        "cache over capacity but every entry is pinned"
                    );
                    break;
                }
            }
        }
    }

    fn next_seq(&self) -> u64 {
        self.access_seq.fetch_add(1, Ordering::Relaxed)
    }
}

/// File extension hint for the decoder, derived from the URL path
fn extension_hint(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
