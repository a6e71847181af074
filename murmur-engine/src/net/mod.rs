//! Byte transport with progress and cancellation
//!
//! The cache is transport-agnostic: it asks a [`Transport`] for the raw
//! bytes of a URL and receives download progress along the way. The shipped
//! implementation streams over HTTP with reqwest; tests swap in
//! [`MemoryTransport`] to serve canned bodies and failures without sockets.

use crate::error::CacheError;
use futures::future::BoxFuture;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Download progress report
#[derive(Debug, Clone, Copy)]
pub struct FetchProgress {
    /// Bytes received so far
    pub bytes: u64,

    /// Total body length, when the transport can know it
    pub total: Option<u64>,
}

/// Per-fetch progress callback
pub type FetchProgressFn = Arc<dyn Fn(FetchProgress) + Send + Sync>;

/// Cooperative cancellation flag shared between a caller and an in-flight fetch
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; the fetch aborts at its next chunk boundary
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Source of raw audio bytes
pub trait Transport: Send + Sync + 'static {
    /// Fetch the complete body of `url`
    ///
    /// Implementations report progress per chunk and honour `cancel` by
    /// returning [`CacheError::Aborted`] promptly.
    fn fetch(
        &self,
        url: String,
        progress: Option<FetchProgressFn>,
        cancel: CancelToken,
    ) -> BoxFuture<'static, Result<Vec<u8>, CacheError>>;
}

/// HTTP transport backed by reqwest
///
/// Streams the body chunk by chunk so progress is real rather than
/// post-hoc, and so cancellation can drop the connection mid-transfer.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HttpTransport {
    fn fetch(
        &self,
        url: String,
        progress: Option<FetchProgressFn>,
        cancel: CancelToken,
    ) -> BoxFuture<'static, Result<Vec<u8>, CacheError>> {
        let client = self.client.clone();
        Box::pin(async move {
            let response = client
                .get(&url)
                .send()
                .await
                .map_err(|e| CacheError::Network(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(CacheError::Http {
                    status: status.as_u16(),
                });
            }

            let total = response.content_length();
            if total.is_none() {
                debug!(url = %url, "response has no content length; progress is indeterminate");
            }

            let mut body: Vec<u8> = Vec::with_capacity(total.unwrap_or(0) as usize);
            let mut stream = response.bytes_stream();

            while let Some(chunk) = stream.next().await {
                if cancel.is_cancelled() {
                    return Err(CacheError::Aborted);
                }
                let chunk = chunk.map_err(|e| CacheError::Network(e.to_string()))?;
                body.extend_from_slice(&chunk);
                if let Some(ref report) = progress {
                    report(FetchProgress {
                        bytes: body.len() as u64,
                        total,
                    });
                }
            }

            if cancel.is_cancelled() {
                return Err(CacheError::Aborted);
            }

            debug!(url = %url, bytes = body.len(), "fetch complete");
            Ok(body)
        })
    }
}

/// In-memory transport for tests and fixtures
///
/// Serves each URL from a canned outcome, counts fetches per URL (so
/// de-duplication is observable), and can delay delivery to widen
/// concurrency windows.
#[derive(Default)]
pub struct MemoryTransport {
    bodies: HashMap<String, Result<Vec<u8>, CacheError>>,
    counts: Arc<HashMap<String, AtomicU64>>,
    delay: Option<Duration>,
    chunk_size: usize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            bodies: HashMap::new(),
            counts: Arc::new(HashMap::new()),
            delay: None,
            chunk_size: 16 * 1024,
        }
    }

    /// Serve `url` with a successful body
    pub fn with_body(mut self, url: &str, body: Vec<u8>) -> Self {
        self.bodies.insert(url.to_string(), Ok(body));
        self
    }

    /// Serve `url` with a failure
    pub fn with_error(mut self, url: &str, error: CacheError) -> Self {
        self.bodies.insert(url.to_string(), Err(error));
        self
    }

    /// Delay each fetch before delivering (default: none)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Finalise the builder, freezing the fetch counters
    pub fn build(mut self) -> Self {
        let counts: HashMap<String, AtomicU64> = self
            .bodies
            .keys()
            .map(|url| (url.clone(), AtomicU64::new(0)))
            .collect();
        self.counts = Arc::new(counts);
        self
    }

    /// How many times `url` has been fetched
    pub fn fetch_count(&self, url: &str) -> u64 {
        self.counts
            .get(url)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl Transport for MemoryTransport {
    fn fetch(
        &self,
        url: String,
        progress: Option<FetchProgressFn>,
        cancel: CancelToken,
    ) -> BoxFuture<'static, Result<Vec<u8>, CacheError>> {
        let outcome = self
            .bodies
            .get(&url)
            .cloned()
            .unwrap_or(Err(CacheError::Http { status: 404 }));
        let counts = Arc::clone(&self.counts);
        let delay = self.delay;
        let chunk_size = self.chunk_size.max(1);

        Box::pin(async move {
            if let Some(counter) = counts.get(&url) {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if cancel.is_cancelled() {
                return Err(CacheError::Aborted);
            }

            let body = outcome?;
            let total = Some(body.len() as u64);
            if let Some(report) = progress {
                let mut delivered = 0usize;
                while delivered < body.len() {
                    delivered = (delivered + chunk_size).min(body.len());
                    report(FetchProgress {
                        bytes: delivered as u64,
                        total,
                    });
                }
            }
            Ok(body)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_memory_transport_serves_body_with_progress() {
        let transport = MemoryTransport::new()
            .with_body("http://x/a", vec![7u8; 40_000])
            .build();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = Arc::clone(&seen);
        let body = transport
            .fetch(
                "http://x/a".into(),
                Some(Arc::new(move |p: FetchProgress| {
                    seen_in.lock().unwrap().push(p.bytes);
                })),
                CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(body.len(), 40_000);
        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert_eq!(*seen.last().unwrap(), 40_000);
        // progress is non-decreasing
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_memory_transport_unknown_url_is_404() {
        let transport = MemoryTransport::new().build();
        let result = transport
            .fetch("http://x/missing".into(), None, CancelToken::new())
            .await;
        assert_eq!(result, Err(CacheError::Http { status: 404 }));
    }

    #[tokio::test]
    async fn test_memory_transport_counts_fetches() {
        let transport = MemoryTransport::new()
            .with_body("http://x/a", vec![1, 2, 3])
            .build();
        for _ in 0..3 {
            transport
                .fetch("http://x/a".into(), None, CancelToken::new())
                .await
                .unwrap();
        }
        assert_eq!(transport.fetch_count("http://x/a"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_fetch() {
        let transport = MemoryTransport::new()
            .with_body("http://x/a", vec![0u8; 8])
            .with_delay(Duration::from_secs(5))
            .build();

        let cancel = CancelToken::new();
        cancel.cancel();
        let result = transport
            .fetch("http://x/a".into(), None, cancel)
            .await;
        assert_eq!(result, Err(CacheError::Aborted));
    }
}
