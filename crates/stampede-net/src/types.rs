use std::{collections::HashMap, ops::Range, sync::Arc, time::Duration};

use crate::error::NetError;

/// Plain string header map.
///
/// Kept deliberately simple: the core only ever sets a handful of headers and
/// reads two of them back.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Headers {
    inner: HashMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl From<HashMap<String, String>> for Headers {
    fn from(map: HashMap<String, String>) -> Self {
        Self { inner: map }
    }
}

/// Hook that may rewrite request headers before a core fetch goes out.
///
/// The HLS layer uses this to stamp a do-not-re-enter marker so that segment
/// downloads issued against the proxy's own address skip the boost path.
pub type RequestHook = Arc<dyn Fn(&mut Headers) + Send + Sync>;

/// Byte range for a `Range:` request header. `end` is inclusive, per HTTP.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: Option<u64>,
}

impl RangeSpec {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// Build from an end-exclusive range (the downloader's native shape).
    ///
    /// # Panics
    ///
    /// Panics if the range is empty.
    pub fn from_exclusive(range: &Range<u64>) -> Self {
        assert!(range.start < range.end, "empty range {range:?}");
        Self {
            start: range.start,
            end: Some(range.end - 1),
        }
    }

    pub fn to_header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Parsed `Content-Range: bytes A-B/T` header. The stored range is
/// end-exclusive.
///
/// Only the fully-specified form is accepted; `bytes */T` and `bytes A-B/*`
/// are not produced by servers we range against and are rejected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentRange {
    pub total: u64,
    pub range: Range<u64>,
}

impl ContentRange {
    pub fn parse(value: &str) -> Result<Self, NetError> {
        let invalid = || NetError::InvalidContentRange(value.to_string());

        let rest = value.trim().strip_prefix("bytes").ok_or_else(invalid)?;
        let rest = rest.trim_start();
        let (span, total) = rest.split_once('/').ok_or_else(invalid)?;
        let (start, end) = span.split_once('-').ok_or_else(invalid)?;

        let start: u64 = start.trim().parse().map_err(|_| invalid())?;
        let end: u64 = end.trim().parse().map_err(|_| invalid())?;
        let total: u64 = total.trim().parse().map_err(|_| invalid())?;
        if end < start {
            return Err(invalid());
        }

        Ok(Self {
            total,
            range: start..end + 1,
        })
    }
}

#[derive(Clone, Debug)]
pub struct NetOptions {
    pub request_timeout: Duration,
    pub pool_max_idle_per_host: usize,
}

impl Default for NetOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 8,
        }
    }
}
