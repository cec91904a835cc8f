// Snapshot discovery over the remote year/month/day/file tree of each VPN server.
// Every directory listing fans out one task per child; a host's crawl succeeds or fails as a whole.

mod fetch;
mod scope;

pub use fetch::{HttpFetcher, RetryPolicy};
pub use scope::TaskScope;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use futures_util::future::join_all;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::SnapshotsConfig;
use crate::models::{DirEntry, SnapshotError, SnapshotKeys, SnapshotRecord};

pub type Snapshots = BTreeMap<DateTime<Utc>, SnapshotRecord>;

#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error("invalid directory entry at {url}: {reason}")]
    InvalidEntry { url: String, reason: String },
    #[error("cannot read timestamp suffix of {name:?} at {url}")]
    BadFilename { url: String, name: String },
    #[error("snapshot {url}: {source}")]
    Snapshot {
        url: String,
        #[source]
        source: SnapshotError,
    },
    #[error("{url}: giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last: String,
    },
    #[error("invalid URL {0:?}")]
    BadUrl(String),
    #[error("crawl task failed: {0}")]
    Join(String),
}

/// Tree level of a directory listing and the accepted name range there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Year,
    Month,
    Day,
}

impl Level {
    fn bounds(self) -> (usize, u32, u32) {
        match self {
            Level::Year => (4, 2024, 2500),
            Level::Month => (2, 1, 12),
            Level::Day => (2, 1, 31),
        }
    }
}

/// Validates a directory entry of `level` and returns its number.
pub fn parse_dir_entry(entry: &DirEntry, level: Level, url: &str) -> Result<u32, CrawlError> {
    let invalid = |reason: String| CrawlError::InvalidEntry {
        url: url.to_string(),
        reason,
    };
    let DirEntry::Directory { name } = entry else {
        return Err(invalid(format!(
            "unexpected item type {}, expected directory",
            entry.kind()
        )));
    };
    let (width, min, max) = level.bounds();
    let value = (name.len() == width && name.bytes().all(|b| b.is_ascii_digit()))
        .then(|| name.parse::<u32>().ok())
        .flatten()
        .filter(|v| (min..=max).contains(v))
        .ok_or_else(|| {
            invalid(format!(
                "unexpected item name {name:?}, expected {min:0width$}..={max:0width$}"
            ))
        })?;
    Ok(value)
}

/// Snapshot layout knobs: reserved body keys and the file-name timestamp suffix.
#[derive(Debug, Clone)]
pub struct SnapshotLayout {
    pub keys: SnapshotKeys,
    pub suffix_format: String,
    pub suffix_length: usize,
}

impl From<&SnapshotsConfig> for SnapshotLayout {
    fn from(c: &SnapshotsConfig) -> Self {
        Self {
            keys: c.keys(),
            suffix_format: c.filename_suffix_format.clone(),
            suffix_length: c.filename_suffix_length,
        }
    }
}

impl SnapshotLayout {
    /// Time encoded in the last `suffix_length` chars of a file name (UTC). Pre-filter only.
    pub fn filename_time(&self, name: &str) -> Option<DateTime<Utc>> {
        let start = name.len().checked_sub(self.suffix_length)?;
        let suffix = name.get(start..)?;
        NaiveDateTime::parse_from_str(suffix, &self.suffix_format)
            .ok()
            .map(|n| n.and_utc())
    }
}

#[derive(Debug, Clone)]
enum Node {
    Root,
    Year(i32),
    Month(i32, u32),
    Day(i32, u32, u32),
    File(i32, u32, u32, String),
}

enum Visit {
    Children(Vec<Node>),
    Snapshot(SnapshotRecord),
}

struct HostCrawl {
    fetcher: Arc<HttpFetcher>,
    layout: Arc<SnapshotLayout>,
    base: String,
    since: Option<DateTime<Utc>>,
}

impl HostCrawl {
    fn url(&self, node: &Node) -> String {
        let base = self.base.trim_end_matches('/');
        match node {
            Node::Root => self.base.clone(),
            Node::Year(y) => format!("{base}/{y}/"),
            Node::Month(y, m) => format!("{base}/{y}/{m:02}/"),
            Node::Day(y, m, d) => format!("{base}/{y}/{m:02}/{d:02}/"),
            Node::File(y, m, d, name) => format!("{base}/{y}/{m:02}/{d:02}/{name}"),
        }
    }

    async fn visit(&self, node: Node) -> Result<Visit, CrawlError> {
        let url = self.url(&node);
        let body = self.fetcher.get_json(&url).await?;
        debug!(url = %url, "fetched");

        if let Node::File(..) = node {
            let snapshot =
                SnapshotRecord::from_json(&body, &self.layout.keys).map_err(|source| {
                    CrawlError::Snapshot {
                        url: url.clone(),
                        source,
                    }
                })?;
            return Ok(Visit::Snapshot(snapshot));
        }

        let entries = listing(body, &url)?;
        let mut children = Vec::with_capacity(entries.len());
        for entry in &entries {
            if let Some(child) = self.child(&node, entry, &url)? {
                children.push(child);
            }
        }
        Ok(Visit::Children(children))
    }

    /// Validated child of `parent`, or None when it lies wholly before `since`.
    fn child(&self, parent: &Node, entry: &DirEntry, url: &str) -> Result<Option<Node>, CrawlError> {
        let since = self.since;
        let child = match *parent {
            Node::Root => {
                let y = parse_dir_entry(entry, Level::Year, url)? as i32;
                let skip = since.is_some_and(|s| y < s.year());
                (!skip).then_some(Node::Year(y))
            }
            Node::Year(y) => {
                let m = parse_dir_entry(entry, Level::Month, url)?;
                let skip = since.is_some_and(|s| y == s.year() && m < s.month());
                (!skip).then_some(Node::Month(y, m))
            }
            Node::Month(y, m) => {
                let d = parse_dir_entry(entry, Level::Day, url)?;
                let skip =
                    since.is_some_and(|s| y == s.year() && m == s.month() && d < s.day());
                (!skip).then_some(Node::Day(y, m, d))
            }
            Node::Day(y, m, d) => {
                let DirEntry::File { name } = entry else {
                    return Err(CrawlError::InvalidEntry {
                        url: url.to_string(),
                        reason: format!("unexpected item type {}, expected file", entry.kind()),
                    });
                };
                let file_time =
                    self.layout
                        .filename_time(name)
                        .ok_or_else(|| CrawlError::BadFilename {
                            url: url.to_string(),
                            name: name.clone(),
                        })?;
                let skip = since.is_some_and(|s| file_time <= s);
                (!skip).then(|| Node::File(y, m, d, name.clone()))
            }
            Node::File(..) => None,
        };
        Ok(child)
    }
}

fn listing(body: Value, url: &str) -> Result<Vec<DirEntry>, CrawlError> {
    serde_json::from_value(body).map_err(|e| CrawlError::InvalidEntry {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

/// Host part of a snapshot base URL; the watermark key.
pub fn hostname_of(url: &str) -> Result<String, CrawlError> {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .ok_or_else(|| CrawlError::BadUrl(url.to_string()))
}

/// Result of crawling one server.
#[derive(Debug)]
pub struct HostResult {
    pub hostname: String,
    pub url: String,
    pub snapshots: Result<Snapshots, CrawlError>,
}

pub struct SnapshotCrawler {
    fetcher: Arc<HttpFetcher>,
    layout: Arc<SnapshotLayout>,
}

impl SnapshotCrawler {
    pub fn new(fetcher: Arc<HttpFetcher>, layout: SnapshotLayout) -> Self {
        Self {
            fetcher,
            layout: Arc::new(layout),
        }
    }

    /// Every snapshot under `base_url` newer than `since`, keyed by the capture time in its body.
    #[instrument(skip(self), fields(operation = "fetch_new"))]
    pub async fn fetch_new(
        &self,
        base_url: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Snapshots, CrawlError> {
        let crawl = Arc::new(HostCrawl {
            fetcher: self.fetcher.clone(),
            layout: self.layout.clone(),
            base: base_url.to_string(),
            since,
        });

        let mut scope: TaskScope<Visit> = TaskScope::new();
        let root = crawl.clone();
        scope.spawn(async move { root.visit(Node::Root).await });

        let mut snapshots = Snapshots::new();
        while let Some(visit) = scope.next().await {
            match visit? {
                Visit::Children(children) => {
                    for node in children {
                        let crawl = crawl.clone();
                        scope.spawn(async move { crawl.visit(node).await });
                    }
                }
                Visit::Snapshot(snapshot) => {
                    let at = snapshot.captured_at;
                    if snapshots.insert(at, snapshot).is_some() {
                        warn!(
                            url = %base_url,
                            captured_at = %at,
                            "two snapshots share a capture time, keeping one"
                        );
                    }
                }
            }
        }
        Ok(snapshots)
    }

    /// Crawls all servers concurrently, one result per hostname. `last` maps hostname to its watermark.
    pub async fn fetch_all(
        &self,
        urls: &[String],
        last: &HashMap<String, DateTime<Utc>>,
    ) -> Vec<HostResult> {
        let crawls = urls.iter().map(|url| async move {
            let hostname = match hostname_of(url) {
                Ok(h) => h,
                Err(e) => {
                    return HostResult {
                        hostname: url.clone(),
                        url: url.clone(),
                        snapshots: Err(e),
                    };
                }
            };
            let since = last.get(&hostname).copied();
            let snapshots = self.fetch_new(url, since).await;
            match &snapshots {
                Ok(s) => info!(host = %hostname, new_snapshots = s.len(), "crawl complete"),
                Err(e) => info!(host = %hostname, error = %e, "crawl failed"),
            }
            HostResult {
                hostname,
                url: url.clone(),
                snapshots,
            }
        });
        merge_by_host(join_all(crawls).await)
    }
}

/// Folds results of URLs that share a hostname into one, in first-seen order.
/// A host fails as a whole when any of its URLs failed.
pub fn merge_by_host(results: Vec<HostResult>) -> Vec<HostResult> {
    let mut merged: Vec<HostResult> = Vec::with_capacity(results.len());
    for result in results {
        let Some(host) = merged.iter_mut().find(|h| h.hostname == result.hostname) else {
            merged.push(result);
            continue;
        };
        if host.snapshots.is_err() {
            continue;
        }
        match result.snapshots {
            Err(e) => {
                host.url = result.url;
                host.snapshots = Err(e);
            }
            Ok(from) => {
                if let Ok(into) = &mut host.snapshots {
                    for (at, snapshot) in from {
                        if into.insert(at, snapshot).is_some() {
                            warn!(
                                host = %host.hostname,
                                url = %result.url,
                                captured_at = %at,
                                "capture time already seen on another URL of this host"
                            );
                        }
                    }
                }
            }
        }
    }
    merged
}
