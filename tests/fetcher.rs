use std::io::Write;

use chrono::DateTime;
use flate2::write::GzEncoder;
use flate2::Compression;
use schedule_keeper::cache::CacheStore;
use schedule_keeper::config::Config;
use schedule_keeper::error::AppError;
use schedule_keeper::fetch::{FetchPolicy, Fetcher, NetworkStatus, Provenance};
use tempfile::TempDir;
use tokio::sync::mpsc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LAST_MODIFIED: &str = "Sun, 06 Nov 1994 08:49:37 GMT";

struct Harness {
    _tmp: TempDir,
    server: MockServer,
    fetcher: Fetcher,
    network: NetworkStatus,
}

impl Harness {
    async fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let tmp = TempDir::new().unwrap();
        let server = MockServer::start().await;
        let cache = CacheStore::new(tmp.path().join("cache")).unwrap();
        let network = NetworkStatus::default();
        let config = Config {
            timeout_secs: 5,
            connect_timeout_secs: 5,
            ..Config::default()
        };
        let fetcher = Fetcher::new(&config, cache, network.clone()).unwrap();
        Self {
            _tmp: tmp,
            server,
            fetcher,
            network,
        }
    }

    fn url(&self) -> String {
        format!("{}/sched.xml", self.server.uri())
    }

    async fn serve(&self, body: &[u8]) {
        Mock::given(method("GET"))
            .and(path("/sched.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Last-Modified", LAST_MODIFIED)
                    .set_body_bytes(body.to_vec()),
            )
            .mount(&self.server)
            .await;
    }

    /// Download and keep `body`, leaving it as the cached copy.
    async fn prime(&self, body: &[u8]) {
        self.serve(body).await;
        let mut download = self.fetcher.fetch(&self.url(), FetchPolicy::Fetch).await.unwrap();
        download.read_to_end().await.unwrap();
        download.keep().await.unwrap();
        self.server.reset().await;
    }
}

fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

#[tokio::test]
async fn test_fetch_then_keep_populates_cache() {
    let h = Harness::new().await;
    h.serve(b"<schedule>v1</schedule>").await;

    let mut download = h.fetcher.fetch(&h.url(), FetchPolicy::Fetch).await.unwrap();
    assert_eq!(download.provenance(), Provenance::Network);
    assert_eq!(download.text().await.unwrap(), "<schedule>v1</schedule>");

    let entry = download.keep().await.unwrap().unwrap();
    assert_eq!(entry.size, 23);
    assert_eq!(entry.last_modified, DateTime::from_timestamp(784_111_777, 0));

    let (bytes, _) = h.fetcher.cache().get(&h.url()).await.unwrap().unwrap();
    assert_eq!(bytes, b"<schedule>v1</schedule>");
}

#[tokio::test]
async fn test_unkept_download_leaves_cache_alone() {
    let h = Harness::new().await;
    h.serve(b"<schedule/>").await;

    let mut download = h.fetcher.fetch(&h.url(), FetchPolicy::Fetch).await.unwrap();
    download.read_to_end().await.unwrap();
    drop(download);

    assert!(h.fetcher.cache().get(&h.url()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_keep_drains_unread_body() {
    let h = Harness::new().await;
    let body = vec![b'a'; 100_000];
    h.serve(&body).await;

    let download = h.fetcher.fetch(&h.url(), FetchPolicy::Fetch).await.unwrap();
    let entry = download.keep().await.unwrap().unwrap();

    assert_eq!(entry.size, 100_000);
}

#[tokio::test]
async fn test_not_modified_serves_cached_copy() {
    let h = Harness::new().await;
    h.prime(b"cached body").await;

    Mock::given(method("GET"))
        .and(path("/sched.xml"))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&h.server)
        .await;

    let mut download = h.fetcher.fetch(&h.url(), FetchPolicy::Fetch).await.unwrap();
    let requests = h.server.received_requests().await.unwrap();
    assert_eq!(
        requests[0].headers.get("if-modified-since").unwrap().to_str().unwrap(),
        LAST_MODIFIED
    );
    assert_eq!(download.provenance(), Provenance::Revalidated);
    assert!(download.provenance().from_cache());
    assert_eq!(download.read_to_end().await.unwrap(), b"cached body");
    assert!(download.keep().await.unwrap().is_none());

    let (bytes, lm) = h.fetcher.cache().get(&h.url()).await.unwrap().unwrap();
    assert_eq!(bytes, b"cached body");
    assert_eq!(lm, DateTime::from_timestamp(784_111_777, 0));
}

#[tokio::test]
async fn test_ignore_cache_sends_no_precondition() {
    let h = Harness::new().await;
    h.prime(b"old").await;
    h.serve(b"new").await;

    let mut download = h
        .fetcher
        .fetch(&h.url(), FetchPolicy::FetchIgnoreCache)
        .await
        .unwrap();
    assert_eq!(download.read_to_end().await.unwrap(), b"new");
    download.keep().await.unwrap();

    let requests = h.server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].headers.get("if-modified-since").is_none());
    assert_eq!(h.fetcher.cache().get(&h.url()).await.unwrap().unwrap().0, b"new");
}

#[tokio::test]
async fn test_error_status_is_transport_failure() {
    let h = Harness::new().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&h.server)
        .await;

    let err = h.fetcher.fetch(&h.url(), FetchPolicy::Fetch).await.err().unwrap();
    match err {
        AppError::Transport(status) => assert!(status.contains("404")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_prefer_cache_falls_back_on_server_error() {
    let h = Harness::new().await;
    h.prime(b"last good copy").await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&h.server)
        .await;

    let mut download = h
        .fetcher
        .fetch(&h.url(), FetchPolicy::FetchPreferCacheOnFailure)
        .await
        .unwrap();
    assert_eq!(download.provenance(), Provenance::Cache);
    assert_eq!(download.read_to_end().await.unwrap(), b"last good copy");
}

#[tokio::test]
async fn test_prefer_cache_offline_never_touches_network() {
    let h = Harness::new().await;
    h.prime(b"last good copy").await;
    h.network.set_online(false);

    let mut download = h
        .fetcher
        .fetch(&h.url(), FetchPolicy::FetchPreferCacheOnFailure)
        .await
        .unwrap();
    assert_eq!(download.read_to_end().await.unwrap(), b"last good copy");
    assert!(h.server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_prefer_cache_without_copy_reports_network_error() {
    let h = Harness::new().await;
    h.network.set_online(false);

    let err = h
        .fetcher
        .fetch(&h.url(), FetchPolicy::FetchPreferCacheOnFailure)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AppError::NoConnectivity));
}

#[tokio::test]
async fn test_cache_policy_without_copy() {
    let h = Harness::new().await;

    let err = h.fetcher.fetch(&h.url(), FetchPolicy::Cache).await.err().unwrap();
    assert!(matches!(err, AppError::NoCachedCopy(_)));
    assert!(h.server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cache_or_fetch_prefers_cached_copy() {
    let h = Harness::new().await;
    h.prime(b"cached").await;
    h.serve(b"remote").await;

    let mut download = h
        .fetcher
        .fetch(&h.url(), FetchPolicy::CacheOrFetch)
        .await
        .unwrap();
    assert_eq!(download.provenance(), Provenance::Cache);
    assert_eq!(download.read_to_end().await.unwrap(), b"cached");
    assert!(h.server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_fetch_offline() {
    let h = Harness::new().await;
    h.network.set_online(false);

    let err = h.fetcher.fetch(&h.url(), FetchPolicy::Fetch).await.err().unwrap();
    assert!(matches!(err, AppError::NoConnectivity));
}

#[tokio::test]
async fn test_gzip_body_is_cached_as_plaintext() {
    let h = Harness::new().await;
    let plain = b"<schedule><event id=\"1\"/></schedule>".repeat(50);
    Mock::given(method("GET"))
        .and(header("Accept-Encoding", "gzip"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Encoding", "gzip")
                .set_body_bytes(gzip(&plain)),
        )
        .mount(&h.server)
        .await;

    let mut download = h.fetcher.fetch(&h.url(), FetchPolicy::Fetch).await.unwrap();
    assert_eq!(download.read_to_end().await.unwrap(), plain);
    download.keep().await.unwrap();

    assert_eq!(h.fetcher.cache().get(&h.url()).await.unwrap().unwrap().0, plain);
}

#[tokio::test]
async fn test_broken_gzip_is_decode_error() {
    let h = Harness::new().await;
    h.prime(b"previous").await;
    let mut body = gzip(&[b'x'; 4096]);
    body.truncate(body.len() - 6);
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Encoding", "gzip")
                .set_body_bytes(body),
        )
        .mount(&h.server)
        .await;

    let mut download = h
        .fetcher
        .fetch(&h.url(), FetchPolicy::FetchIgnoreCache)
        .await
        .unwrap();
    let err = download.read_to_end().await.err().unwrap();
    assert!(matches!(err, AppError::Decode(_)));
    drop(download);

    assert_eq!(h.fetcher.cache().get(&h.url()).await.unwrap().unwrap().0, b"previous");
}

#[tokio::test]
async fn test_progress_reports_are_monotonic() {
    let h = Harness::new().await;
    h.serve(&vec![b'p'; 64 * 1024]).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut download = h.fetcher.fetch(&h.url(), FetchPolicy::Fetch).await.unwrap();
    download.set_progress_observer(tx);
    download.read_to_end().await.unwrap();

    let mut seen = Vec::new();
    while let Ok(p) = rx.try_recv() {
        seen.push(p);
    }
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert!(seen.iter().all(|p| (1..=100).contains(p)));
    assert_eq!(*seen.last().unwrap(), 100);
}

#[tokio::test]
async fn test_lookahead_is_not_counted_and_replays() {
    let h = Harness::new().await;
    let body = b"<?xml version=\"1.0\"?><schedule/>".to_vec();
    h.serve(&body).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut download = h.fetcher.fetch(&h.url(), FetchPolicy::Fetch).await.unwrap();
    download.set_progress_observer(tx);

    download.mark(1024);
    let sniffed = download.next_chunk().await.unwrap().unwrap();
    assert!(rx.try_recv().is_err());
    assert!(download.reset());

    assert!(body.starts_with(&sniffed));
    assert_eq!(download.read_to_end().await.unwrap(), body);

    let mut last = None;
    while let Ok(p) = rx.try_recv() {
        last = Some(p);
    }
    assert_eq!(last, Some(100));
}

#[tokio::test]
async fn test_cancel_keeps_previous_copy() {
    let h = Harness::new().await;
    h.prime(b"good").await;
    h.serve(b"garbage").await;

    let mut download = h.fetcher.fetch(&h.url(), FetchPolicy::Fetch).await.unwrap();
    download.read_to_end().await.unwrap();
    download.cancel().await.unwrap();

    assert_eq!(h.fetcher.cache().get(&h.url()).await.unwrap().unwrap().0, b"good");
}

#[tokio::test]
async fn test_cancel_under_ignore_cache_drops_previous_copy() {
    let h = Harness::new().await;
    h.prime(b"suspect").await;
    h.serve(b"garbage").await;

    let mut download = h
        .fetcher
        .fetch(&h.url(), FetchPolicy::FetchIgnoreCache)
        .await
        .unwrap();
    download.read_to_end().await.unwrap();
    download.cancel().await.unwrap();

    assert!(h.fetcher.cache().get(&h.url()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_cached_copy_invalidates_it() {
    let h = Harness::new().await;
    h.prime(b"corrupt").await;

    let mut download = h.fetcher.fetch(&h.url(), FetchPolicy::Cache).await.unwrap();
    download.read_to_end().await.unwrap();
    download.cancel().await.unwrap();

    assert!(h.fetcher.cache().get(&h.url()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_malformed_url() {
    let h = Harness::new().await;
    let err = h.fetcher.fetch("not a url", FetchPolicy::Fetch).await.err().unwrap();
    assert!(matches!(err, AppError::Url(_)));
}

#[tokio::test]
async fn test_lookahead_past_limit_cannot_rewind() {
    let h = Harness::new().await;
    let body = vec![b'z'; 64 * 1024];
    h.serve(&body).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut download = h.fetcher.fetch(&h.url(), FetchPolicy::Fetch).await.unwrap();
    download.set_progress_observer(tx);

    download.mark(16);
    let mut peeked = Vec::new();
    while peeked.len() <= 16 {
        peeked.extend(download.next_chunk().await.unwrap().unwrap());
    }
    assert!(!download.reset());

    let rest = download.read_to_end().await.unwrap();
    assert_eq!(peeked.len() + rest.len(), body.len());

    let mut last = None;
    while let Ok(p) = rx.try_recv() {
        last = Some(p);
    }
    assert_eq!(last, Some(100));
}
