use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT_ENCODING, CONTENT_ENCODING, IF_MODIFIED_SINCE, LAST_MODIFIED};
use reqwest::{Client, Response, StatusCode};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::UnboundedSender;
use url::Url;

use crate::cache::{CacheEntry, CacheStore};
use crate::config::Config;
use crate::error::{AppError, Result};

use super::network::NetworkStatus;
use super::pipeline::{GzipStage, Lookahead, Pipeline, ProgressMeter};

const CACHE_READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPolicy {
    /// Cached copy or fail.
    Cache,
    /// Cached copy, download only if there is none.
    CacheOrFetch,
    /// Check online if we can, otherwise use the cached copy.
    FetchPreferCacheOnFailure,
    /// Conditional download; 304 serves the cached copy.
    Fetch,
    /// Unconditional download, cached copy is not trusted.
    FetchIgnoreCache,
}

impl FetchPolicy {
    fn sends_precondition(self) -> bool {
        !matches!(self, FetchPolicy::FetchIgnoreCache)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// New bytes from the server.
    Network,
    /// Cached bytes the server just confirmed with a 304.
    Revalidated,
    /// Cached bytes, server not consulted (or unreachable).
    Cache,
}

impl Provenance {
    pub fn from_cache(self) -> bool {
        matches!(self, Provenance::Revalidated | Provenance::Cache)
    }

    /// Whether the server vouched for these bytes during this fetch.
    pub fn is_fresh(self) -> bool {
        matches!(self, Provenance::Network | Provenance::Revalidated)
    }
}

pub struct Fetcher {
    client: Client,
    cache: CacheStore,
    network: NetworkStatus,
}

impl Fetcher {
    pub fn new(config: &Config, cache: CacheStore, network: NetworkStatus) -> Result<Self> {
        // No automatic decompression: gzip is handled in the pipeline so the
        // cache always holds plaintext and progress tracks wire bytes.
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            cache,
            network,
        })
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn network(&self) -> &NetworkStatus {
        &self.network
    }

    pub async fn fetch(&self, url: &str, policy: FetchPolicy) -> Result<Download> {
        tracing::debug!("Creating fetcher for {} policy={:?}", url, policy);
        Url::parse(url)?;

        match policy {
            FetchPolicy::Cache => self
                .from_cache(url, policy, Provenance::Cache)
                .await?
                .ok_or_else(|| AppError::NoCachedCopy(url.to_string())),

            FetchPolicy::CacheOrFetch => {
                if let Some(download) = self.from_cache(url, policy, Provenance::Cache).await? {
                    return Ok(download);
                }
                self.from_network(url, policy).await
            }

            FetchPolicy::FetchPreferCacheOnFailure => {
                match self.from_network(url, policy).await {
                    Ok(download) => Ok(download),
                    Err(e) if e.is_network_failure() => {
                        tracing::info!("Fetching {} failed ({}), trying cached copy", url, e);
                        self.from_cache(url, policy, Provenance::Cache)
                            .await?
                            .ok_or(e)
                    }
                    Err(e) => Err(e),
                }
            }

            FetchPolicy::Fetch | FetchPolicy::FetchIgnoreCache => {
                self.from_network(url, policy).await
            }
        }
    }

    async fn from_network(&self, url: &str, policy: FetchPolicy) -> Result<Download> {
        if !self.network.is_online() {
            return Err(AppError::NoConnectivity);
        }

        let mut request = self.client.get(url).header(ACCEPT_ENCODING, "gzip");
        if policy.sends_precondition() {
            let cached = self.cache.entry(url).await?;
            if let Some(lm) = cached.and_then(|entry| entry.last_modified) {
                request = request.header(IF_MODIFIED_SINCE, http_date(lm));
            }
        }

        let response = request.send().await?;
        let status = response.status();
        tracing::debug!("HTTP status {} for {}", status, url);

        if status == StatusCode::NOT_MODIFIED {
            tracing::info!("HTTP 304, using cached copy of {}", url);
            return self
                .from_cache(url, policy, Provenance::Revalidated)
                .await?
                .ok_or_else(|| {
                    AppError::Transport(format!(
                        "{} without a cached copy of {}",
                        status_line(&response),
                        url
                    ))
                });
        }
        if status != StatusCode::OK {
            return Err(AppError::Transport(status_line(&response)));
        }

        let gzipped = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|enc| enc.contains("gzip"));
        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);

        let staging = self.cache.begin_replace(url).await?;
        let pipeline = Pipeline::new(
            ProgressMeter::new(response.content_length()),
            gzipped.then(GzipStage::new),
            Some(staging),
        );

        Ok(Download {
            url: url.to_string(),
            policy,
            provenance: Provenance::Network,
            body: Body::Network(response),
            pipeline,
            lookahead: Lookahead::default(),
            last_modified,
            cache: self.cache.clone(),
            exhausted: false,
        })
    }

    async fn from_cache(
        &self,
        url: &str,
        policy: FetchPolicy,
        provenance: Provenance,
    ) -> Result<Option<Download>> {
        let Some((file, entry)) = self.cache.open(url).await? else {
            return Ok(None);
        };
        tracing::debug!("Reading {} bytes of {} from cache", entry.size, url);

        Ok(Some(Download {
            url: url.to_string(),
            policy,
            provenance,
            body: Body::Cache(file),
            pipeline: Pipeline::new(ProgressMeter::new(Some(entry.size)), None, None),
            lookahead: Lookahead::default(),
            last_modified: entry.last_modified,
            cache: self.cache.clone(),
            exhausted: false,
        }))
    }
}

enum Body {
    Network(Response),
    Cache(tokio::fs::File),
}

impl Body {
    async fn next_raw(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            Body::Network(response) => Ok(response.chunk().await?.map(|b| b.to_vec())),
            Body::Cache(file) => {
                let mut buf = vec![0; CACHE_READ_CHUNK];
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    return Ok(None);
                }
                buf.truncate(n);
                Ok(Some(buf))
            }
        }
    }
}

/// An open download. Finish it with [`keep`](Self::keep) once the content has
/// been accepted, or [`cancel`](Self::cancel) if it turned out to be unusable.
pub struct Download {
    url: String,
    policy: FetchPolicy,
    provenance: Provenance,
    body: Body,
    pipeline: Pipeline,
    lookahead: Lookahead,
    last_modified: Option<DateTime<Utc>>,
    cache: CacheStore,
    exhausted: bool,
}

impl Download {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    /// Receives whole-percent progress; the sender is never blocked.
    pub fn set_progress_observer(&mut self, observer: UnboundedSender<u8>) {
        self.pipeline.meter.set_observer(observer);
    }

    /// Start a lookahead of at most `read_limit` bytes. Progress is not
    /// counted until [`reset`](Self::reset), or until the limit is passed and
    /// the mark is dropped.
    pub fn mark(&mut self, read_limit: usize) {
        self.lookahead.mark(read_limit);
        self.pipeline.meter.suspend();
    }

    /// Rewind to the last mark. Returns `false` if there is none to go back to.
    pub fn reset(&mut self) -> bool {
        if self.lookahead.reset() {
            self.pipeline.meter.resume();
            true
        } else {
            tracing::warn!("reset() on {} without a valid mark", self.url);
            false
        }
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(chunk) = self.lookahead.next_replay() {
            self.record(&chunk);
            return Ok(Some(chunk));
        }

        while !self.exhausted {
            let plain = match self.body.next_raw().await? {
                Some(raw) => self.pipeline.feed(&raw).await?,
                None => {
                    self.exhausted = true;
                    self.pipeline.finish().await?
                }
            };
            if !plain.is_empty() {
                self.record(&plain);
                return Ok(Some(plain));
            }
        }
        Ok(None)
    }

    fn record(&mut self, chunk: &[u8]) {
        if self.lookahead.record(chunk) {
            tracing::debug!("Lookahead on {} passed its limit, dropping mark", self.url);
            self.pipeline.meter.resume();
        }
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    pub async fn text(&mut self) -> Result<String> {
        let bytes = self.read_to_end().await?;
        String::from_utf8(bytes).map_err(|e| AppError::Decode(e.to_string()))
    }

    /// Accept the content. A fresh download becomes the cached copy, stamped
    /// with the server's Last-Modified for the next conditional request.
    pub async fn keep(mut self) -> Result<Option<CacheEntry>> {
        if !self.pipeline.has_sink() {
            return Ok(None);
        }

        // A committed entry must be complete even if the caller stopped early.
        while self.next_chunk().await?.is_some() {}

        let Some(staging) = self.pipeline.take_sink() else {
            return Ok(None);
        };
        let entry = self.cache.commit(staging, self.last_modified).await?;
        tracing::info!("Kept {} ({} bytes)", self.url, entry.size);
        Ok(Some(entry))
    }

    /// Reject the content.
    pub async fn cancel(mut self) -> Result<()> {
        match self.pipeline.take_sink() {
            Some(staging) => {
                self.cache.abort(staging).await?;
                if self.policy == FetchPolicy::FetchIgnoreCache {
                    self.cache.invalidate(&self.url).await?;
                }
            }
            None => {
                // What we served came from the cache, so that copy is the bad one.
                self.cache.invalidate(&self.url).await?;
            }
        }
        tracing::info!("Discarded download of {}", self.url);
        Ok(())
    }
}

fn status_line(response: &Response) -> String {
    format!("{:?} {}", response.version(), response.status())
}

pub(crate) fn http_date(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn parse_http_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
