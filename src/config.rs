use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds};
use thiserror::Error;

use crate::big_segments::BigSegmentStore;
use crate::stores::{CacheMode, PersistentDataStore};
use crate::util::trim_trailing_slashes;

pub const DEFAULT_STREAMING_BASE_URL: &str = "https://stream.launchdarkly.com";
pub const DEFAULT_POLLING_BASE_URL: &str = "https://sdk.launchdarkly.com";

pub const DEFAULT_INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const MIN_INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(1);
pub const DEFAULT_FALLBACK_AFTER: Duration = Duration::from_secs(60);

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(30);

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_STREAM_READ_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_CONTEXT_CACHE_SIZE: usize = 1000;
pub const DEFAULT_CONTEXT_CACHE_TIME: Duration = Duration::from_secs(5);
pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(120);

lazy_static! {
    static ref PAYLOAD_FILTER_REGEX: Regex = Regex::new(r"^[a-zA-Z0-9][._\-a-zA-Z0-9]*$").unwrap();
}

/// Error type returned when a configuration cannot be turned into working components.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("the SDK key cannot be used as a header value")]
    InvalidSdkKey,

    #[error("invalid value for header {0}")]
    InvalidHeader(&'static str),

    #[error("could not build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Base URLs of the remote service.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceEndpoints {
    pub streaming_base_url: String,
    pub polling_base_url: String,
}

impl Default for ServiceEndpoints {
    fn default() -> Self {
        Self {
            streaming_base_url: DEFAULT_STREAMING_BASE_URL.to_string(),
            polling_base_url: DEFAULT_POLLING_BASE_URL.to_string(),
        }
    }
}

impl ServiceEndpoints {
    /// Points both the streaming and polling endpoints at the same base URL, as a relay or a
    /// test server would need.
    pub fn relay(base_url: &str) -> Self {
        Self {
            streaming_base_url: base_url.to_string(),
            polling_base_url: base_url.to_string(),
        }
    }

    pub(crate) fn streaming(&self) -> String {
        trim_trailing_slashes(&self.streaming_base_url)
    }

    pub(crate) fn polling(&self) -> String {
        trim_trailing_slashes(&self.polling_base_url)
    }
}

/// Network settings shared by all data sources.
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "connectTimeoutMs")]
    pub connect_timeout: Duration,

    /// Longest silence tolerated on a stream before it is considered dead. The service sends
    /// heartbeats well within this interval.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "readTimeoutMs")]
    pub read_timeout: Duration,

    /// Total time allowed for a polling request. Never applied to streams.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "requestTimeoutMs")]
    pub request_timeout: Duration,

    pub wrapper_name: Option<String>,
    pub wrapper_version: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_STREAM_READ_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            wrapper_name: None,
            wrapper_version: None,
        }
    }
}

impl HttpConfig {
    /// The value of the wrapper header, if a wrapper name is configured.
    pub(crate) fn wrapper_header(&self) -> Option<String> {
        match (&self.wrapper_name, &self.wrapper_version) {
            (Some(name), Some(version)) => Some(format!("{}/{}", name, version)),
            (Some(name), None) => Some(name.clone()),
            _ => None,
        }
    }
}

fn validated_payload_filter(filter: &Option<String>) -> Option<String> {
    match filter.as_deref() {
        None | Some("") => None,
        Some(key) if PAYLOAD_FILTER_REGEX.is_match(key) => Some(key.to_string()),
        Some(key) => {
            warn!(
                "Payload filter \"{}\" is not a valid filter key and will be ignored",
                key
            );
            None
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamingConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "initialReconnectDelayMs")]
    pub initial_reconnect_delay: Duration,

    pub payload_filter: Option<String>,

    /// How long the stream may stay interrupted before the data system falls back to polling.
    /// `None` disables the fallback.
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(rename = "fallbackAfterMs")]
    pub fallback_after: Option<Duration>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            initial_reconnect_delay: DEFAULT_INITIAL_RECONNECT_DELAY,
            payload_filter: None,
            fallback_after: Some(DEFAULT_FALLBACK_AFTER),
        }
    }
}

impl StreamingConfig {
    pub fn effective_initial_reconnect_delay(&self) -> Duration {
        self.initial_reconnect_delay.max(MIN_INITIAL_RECONNECT_DELAY)
    }

    pub fn effective_payload_filter(&self) -> Option<String> {
        validated_payload_filter(&self.payload_filter)
    }
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct PollingConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "pollIntervalMs")]
    pub poll_interval: Duration,

    pub payload_filter: Option<String>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            payload_filter: None,
        }
    }
}

impl PollingConfig {
    /// The configured interval, raised to the minimum if it is shorter.
    pub fn effective_poll_interval(&self) -> Duration {
        if self.poll_interval < MIN_POLL_INTERVAL {
            warn!(
                "Poll interval {:?} is below the minimum; using {:?}",
                self.poll_interval, MIN_POLL_INTERVAL
            );
            MIN_POLL_INTERVAL
        } else {
            self.poll_interval
        }
    }

    pub fn effective_payload_filter(&self) -> Option<String> {
        validated_payload_filter(&self.payload_filter)
    }
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct BigSegmentsConfig {
    pub context_cache_size: usize,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "contextCacheTimeMs")]
    pub context_cache_time: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "statusPollIntervalMs")]
    pub status_poll_interval: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "staleAfterMs")]
    pub stale_after: Duration,
}

impl Default for BigSegmentsConfig {
    fn default() -> Self {
        Self {
            context_cache_size: DEFAULT_CONTEXT_CACHE_SIZE,
            context_cache_time: DEFAULT_CONTEXT_CACHE_TIME,
            status_poll_interval: DEFAULT_STATUS_POLL_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

/// A persistent store integration and the caching policy to put in front of it.
#[derive(Clone)]
pub struct PersistentStoreConfig {
    pub store: Arc<dyn PersistentDataStore>,
    pub cache: CacheMode,
}

impl PersistentStoreConfig {
    pub fn new(store: Arc<dyn PersistentDataStore>) -> Self {
        Self {
            store,
            cache: CacheMode::default(),
        }
    }
}

impl fmt::Debug for PersistentStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentStoreConfig")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// A big segment store integration and the settings for the wrapper around it.
#[derive(Clone)]
pub struct BigSegmentsSetup {
    pub store: Arc<dyn BigSegmentStore>,
    pub config: BigSegmentsConfig,
}

impl fmt::Debug for BigSegmentsSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigSegmentsSetup")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Where flag data comes from and where it is kept.
#[derive(Clone, Debug)]
pub enum DataSystemMode {
    /// Stream updates into an in-memory store, falling back to polling if the stream stays
    /// interrupted.
    Streaming(StreamingConfig),
    /// Poll for full snapshots into an in-memory store.
    Polling(PollingConfig),
    /// No data source; something outside the SDK writes to the store.
    ExternalUpdatesOnly,
    /// Read-only access to a persistent store that another process (such as a relay) keeps up
    /// to date.
    Daemon(PersistentStoreConfig),
    /// Stream updates into a persistent store.
    PersistentStore {
        store: PersistentStoreConfig,
        streaming: StreamingConfig,
    },
}

impl Default for DataSystemMode {
    fn default() -> Self {
        DataSystemMode::Streaming(StreamingConfig::default())
    }
}

#[derive(Clone, Debug, Default)]
pub struct DataSystemConfig {
    pub sdk_key: String,
    pub endpoints: ServiceEndpoints,
    pub http: HttpConfig,
    pub mode: DataSystemMode,
    pub big_segments: Option<BigSegmentsSetup>,
}

impl DataSystemConfig {
    pub fn new(sdk_key: &str) -> Self {
        Self {
            sdk_key: sdk_key.to_string(),
            ..Default::default()
        }
    }
}
