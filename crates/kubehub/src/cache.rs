//! Disk-backed ETag cache in front of the discovery endpoints.
//!
//! Entries live under `<root>/discovery/<cluster>/<sha256(path)>.json`. While an
//! entry is younger than the TTL it is revalidated with `If-None-Match`; a 304
//! serves the stored body. Past the TTL the request goes out unconditionally.
//! Any status other than 200/304 drops the entry.
//!
//! Writes go to a temp file in the same directory and are renamed into place,
//! so concurrent refreshes from several account workers never leave a torn entry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use metrics::counter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::ClientResult;

pub const DEFAULT_DISCOVERY_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub etag: Option<String>,
    pub body: Vec<u8>,
}

/// Minimal GET transport for discovery documents.
#[async_trait::async_trait]
pub trait DiscoveryTransport: Send + Sync {
    /// Identifies the cluster behind this transport (used to partition the cache).
    fn scope(&self) -> String;

    async fn get(&self, path: &str, if_none_match: Option<&str>) -> ClientResult<RawResponse>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    etag: Option<String>,
    stored_at: i64,
    body: String,
}

pub struct CachedTransport<T> {
    inner: T,
    dir: PathBuf,
    ttl: Duration,
}

impl<T: DiscoveryTransport> CachedTransport<T> {
    pub fn new(inner: T, root: impl AsRef<Path>, ttl: Duration) -> Self {
        let dir = root.as_ref().join("discovery").join(sanitize(&inner.scope()));
        Self { inner, dir, ttl }
    }

    pub fn dir(&self) -> &Path { &self.dir }

    fn entry_path(&self, path: &str) -> PathBuf {
        let digest = Sha256::digest(path.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        self.dir.join(format!("{}.json", hex))
    }

    fn read_entry(&self, path: &str) -> Option<CacheEntry> {
        let bytes = std::fs::read(self.entry_path(path)).ok()?;
        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(e) => Some(e),
            Err(e) => {
                warn!(path, error = %e, "discarding unreadable discovery cache entry");
                self.invalidate(path);
                None
            }
        }
    }

    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        let age = kato_core::now_ts().saturating_sub(entry.stored_at);
        age >= 0 && (age as u64) < self.ttl.as_secs()
    }

    fn write_entry(&self, path: &str, entry: &CacheEntry) -> Result<()> {
        create_private_dir(&self.dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).context("creating discovery cache temp file")?;
        serde_json::to_writer(&mut tmp, entry).context("writing discovery cache entry")?;
        tmp.persist(self.entry_path(path)).map_err(|e| e.error).context("persisting discovery cache entry")?;
        Ok(())
    }

    fn invalidate(&self, path: &str) {
        let _ = std::fs::remove_file(self.entry_path(path));
    }
}

#[async_trait::async_trait]
impl<T: DiscoveryTransport> DiscoveryTransport for CachedTransport<T> {
    fn scope(&self) -> String { self.inner.scope() }

    async fn get(&self, path: &str, _if_none_match: Option<&str>) -> ClientResult<RawResponse> {
        let cached = self.read_entry(path).filter(|e| self.is_fresh(e));
        let etag = cached.as_ref().and_then(|e| e.etag.clone());
        let resp = self.inner.get(path, etag.as_deref()).await?;
        match (resp.status, cached) {
            (304, Some(entry)) => {
                counter!("discovery_cache_hits", 1u64);
                debug!(path, "discovery cache revalidated");
                Ok(RawResponse { status: 200, etag: entry.etag, body: entry.body.into_bytes() })
            }
            (200, _) => {
                counter!("discovery_cache_misses", 1u64);
                match std::str::from_utf8(&resp.body) {
                    Ok(body) => {
                        let entry = CacheEntry { etag: resp.etag.clone(), stored_at: kato_core::now_ts(), body: body.to_string() };
                        if let Err(e) = self.write_entry(path, &entry) {
                            warn!(path, error = %e, "discovery cache write failed");
                        }
                    }
                    Err(_) => self.invalidate(path),
                }
                Ok(resp)
            }
            (status, _) => {
                debug!(path, status, "discovery cache invalidated");
                self.invalidate(path);
                Ok(resp)
            }
        }
    }
}

fn sanitize(scope: &str) -> String {
    scope.chars().map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' }).collect()
}

/// Create `dir` (and parents) readable by the owner only.
pub fn create_private_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .with_context(|| format!("creating cache dir {}", dir.display()))?;
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir).with_context(|| format!("creating cache dir {}", dir.display()))?;
    }
    Ok(())
}

/// `KATO_CACHE_DIR`, else `~/.kato/cache`, else `./.kato-cache`.
pub fn default_cache_root() -> PathBuf {
    if let Ok(dir) = std::env::var("KATO_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".kato");
        p.push("cache");
        return p;
    }
    PathBuf::from(".kato-cache")
}

/// `KATO_DISCOVERY_TTL_SECS`, else the ten-minute default.
pub fn default_ttl() -> Duration {
    std::env::var("KATO_DISCOVERY_TTL_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_DISCOVERY_TTL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serves one body with a fixed ETag and answers 304 when it matches.
    struct FakeServer {
        etag: String,
        body: String,
        seen: Mutex<Vec<Option<String>>>,
        fail_with: Mutex<Option<u16>>,
    }

    impl FakeServer {
        fn new() -> Self {
            Self { etag: "\"v1\"".into(), body: "{\"kind\":\"APIVersions\"}".into(), seen: Mutex::new(vec![]), fail_with: Mutex::new(None) }
        }
        fn seen(&self) -> Vec<Option<String>> { self.seen.lock().unwrap().clone() }
    }

    #[async_trait::async_trait]
    impl<'a> DiscoveryTransport for &'a FakeServer {
        fn scope(&self) -> String { "https://10.0.0.1:443".into() }

        async fn get(&self, _path: &str, if_none_match: Option<&str>) -> ClientResult<RawResponse> {
            self.seen.lock().unwrap().push(if_none_match.map(|s| s.to_string()));
            if let Some(code) = *self.fail_with.lock().unwrap() {
                return Ok(RawResponse { status: code, etag: None, body: b"boom".to_vec() });
            }
            if if_none_match == Some(self.etag.as_str()) {
                return Ok(RawResponse { status: 304, etag: Some(self.etag.clone()), body: vec![] });
            }
            Ok(RawResponse { status: 200, etag: Some(self.etag.clone()), body: self.body.clone().into_bytes() })
        }
    }

    #[tokio::test]
    async fn revalidates_with_etag_and_serves_cached_body() {
        let root = tempfile::tempdir().unwrap();
        let server = FakeServer::new();
        let cache = CachedTransport::new(&server, root.path(), DEFAULT_DISCOVERY_TTL);

        let first = cache.get("/api", None).await.unwrap();
        assert_eq!(first.status, 200);
        let second = cache.get("/api", None).await.unwrap();
        assert_eq!(second.status, 200);
        assert_eq!(second.body, first.body);
        assert_eq!(server.seen(), vec![None, Some("\"v1\"".to_string())]);
    }

    #[tokio::test]
    async fn expired_entries_fetch_unconditionally() {
        let root = tempfile::tempdir().unwrap();
        let server = FakeServer::new();
        let cache = CachedTransport::new(&server, root.path(), Duration::ZERO);
        cache.get("/apis", None).await.unwrap();
        cache.get("/apis", None).await.unwrap();
        assert_eq!(server.seen(), vec![None, None]);
    }

    #[tokio::test]
    async fn error_status_invalidates_entry() {
        let root = tempfile::tempdir().unwrap();
        let server = FakeServer::new();
        let cache = CachedTransport::new(&server, root.path(), DEFAULT_DISCOVERY_TTL);
        cache.get("/apis", None).await.unwrap();
        assert!(cache.entry_path("/apis").exists());

        *server.fail_with.lock().unwrap() = Some(503);
        let resp = cache.get("/apis", None).await.unwrap();
        assert_eq!(resp.status, 503);
        assert!(!cache.entry_path("/apis").exists());

        *server.fail_with.lock().unwrap() = None;
        cache.get("/apis", None).await.unwrap();
        assert_eq!(server.seen().last().cloned().unwrap(), None);
    }

    #[tokio::test]
    async fn creates_missing_root_with_owner_only_permissions() {
        let base = tempfile::tempdir().unwrap();
        let root = base.path().join("does").join("not").join("exist");
        let server = FakeServer::new();
        let cache = CachedTransport::new(&server, &root, DEFAULT_DISCOVERY_TTL);
        cache.get("/api", None).await.unwrap();
        assert!(cache.dir().exists());
        assert!(cache.dir().ends_with("https___10.0.0.1_443"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(cache.dir()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
            let file_mode = std::fs::metadata(cache.entry_path("/api")).unwrap().permissions().mode();
            assert_eq!(file_mode & 0o077, 0);
        }
    }
}
