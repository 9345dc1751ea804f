use lazy_static::lazy_static;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use thiserror::Error;

use crate::config::{ConfigError, HttpConfig};
use crate::data_source::ErrorKind;

lazy_static! {
    static ref SDK_USER_AGENT: String = format!("RustServerClient/{}", env!("CARGO_PKG_VERSION"));
}

const WRAPPER_HEADER: &str = "X-LaunchDarkly-Wrapper";

/// Error type returned by requests to the remote service.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The service answered with a status code other than 200 or 304.
    #[error("HTTP error {status}")]
    UnexpectedStatus { status: u16 },

    /// The connection failed, timed out, or ended before the response was complete.
    #[error("network error: {0}")]
    Network(String),

    /// A response arrived but its content could not be understood.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl RequestError {
    /// Whether retrying the request could succeed. Authorization and not-found style errors will
    /// keep failing until the configuration changes, so they are not worth retrying.
    pub fn is_recoverable(&self) -> bool {
        match self {
            RequestError::UnexpectedStatus { status } => is_http_error_recoverable(*status),
            _ => true,
        }
    }

    pub fn error_kind(&self) -> ErrorKind {
        match self {
            RequestError::UnexpectedStatus { .. } => ErrorKind::ErrorResponse,
            RequestError::Network(_) => ErrorKind::NetworkError,
            RequestError::InvalidData(_) => ErrorKind::InvalidData,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            RequestError::UnexpectedStatus { status } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for RequestError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RequestError::InvalidData(e.to_string())
        } else {
            RequestError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for RequestError {
    fn from(e: serde_json::Error) -> Self {
        RequestError::InvalidData(e.to_string())
    }
}

/// Classifies an HTTP error status. 400, 408, 429 and every 5xx are worth retrying; any other
/// 4xx means the request itself is unacceptable.
pub fn is_http_error_recoverable(status: u16) -> bool {
    if (400..500).contains(&status) {
        matches!(status, 400 | 408 | 429)
    } else {
        true
    }
}

pub(crate) fn default_headers(sdk_key: &str, http: &HttpConfig) -> Result<HeaderMap, ConfigError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(sdk_key).map_err(|_| ConfigError::InvalidSdkKey)?,
    );
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&SDK_USER_AGENT)
            .map_err(|_| ConfigError::InvalidHeader("User-Agent"))?,
    );
    if let Some(wrapper) = http.wrapper_header() {
        headers.insert(
            WRAPPER_HEADER,
            HeaderValue::from_str(&wrapper)
                .map_err(|_| ConfigError::InvalidHeader(WRAPPER_HEADER))?,
        );
    }
    Ok(headers)
}

/// Client for long-lived stream connections. Only the connect phase is bounded here; the idle
/// read timeout is applied by the stream reader, since a total request timeout would cut off a
/// healthy stream.
pub(crate) fn streaming_client(
    sdk_key: &str,
    http: &HttpConfig,
) -> Result<reqwest::Client, ConfigError> {
    Ok(reqwest::Client::builder()
        .default_headers(default_headers(sdk_key, http)?)
        .connect_timeout(http.connect_timeout)
        .build()?)
}

/// Client for unary polling requests, bounded by the total request timeout.
pub(crate) fn polling_client(
    sdk_key: &str,
    http: &HttpConfig,
) -> Result<reqwest::Client, ConfigError> {
    Ok(reqwest::Client::builder()
        .default_headers(default_headers(sdk_key, http)?)
        .connect_timeout(http.connect_timeout)
        .timeout(http.request_timeout)
        .build()?)
}
