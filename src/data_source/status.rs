use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::broadcaster::Broadcaster;
use crate::http::RequestError;

/// State describes the freshness of the data a data source has delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// The data source has not yet received any data, or has not yet failed in a way that
    /// means it never will.
    Initializing,
    /// The data source is connected and delivering updates.
    Valid,
    /// The data source had been working but is currently failing; it keeps retrying and the
    /// store keeps serving the last known data.
    Interrupted,
    /// The data source has permanently stopped, either because it was closed or because of an
    /// error that retrying cannot fix.
    Off,
}

/// The category of a data source failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Unknown,
    /// A transport or I/O failure.
    NetworkError,
    /// The service returned an error status; see [ErrorInfo::status_code].
    ErrorResponse,
    /// The service returned data that could not be parsed.
    InvalidData,
    /// The data store rejected a write.
    StoreError,
}

/// A description of the most recent data source failure.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub status_code: Option<u16>,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code: None,
            message: message.into(),
            time: Utc::now(),
        }
    }

    pub fn from_request_error(err: &RequestError) -> Self {
        Self {
            kind: err.error_kind(),
            status_code: err.status_code(),
            message: err.to_string(),
            time: Utc::now(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{:?}({}) {}", self.kind, code, self.message),
            None => write!(f, "{:?} {}", self.kind, self.message),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DataSourceStatus {
    pub state: State,
    /// When `state` was entered.
    pub state_since: DateTime<Utc>,
    /// The most recent failure, kept after the source recovers.
    pub last_error: Option<ErrorInfo>,
}

/// DataSourceStatusProvider holds the current [DataSourceStatus] and notifies subscribers of
/// every change, in order.
///
/// Two rules shape the transitions: a failure before the source has ever succeeded leaves the
/// state at [State::Initializing], and [State::Off] is final.
pub struct DataSourceStatusProvider {
    status: Mutex<DataSourceStatus>,
    broadcaster: Broadcaster<DataSourceStatus>,
}

impl DataSourceStatusProvider {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(DataSourceStatus {
                state: State::Initializing,
                state_since: Utc::now(),
                last_error: None,
            }),
            broadcaster: Broadcaster::new(),
        }
    }

    pub fn status(&self) -> DataSourceStatus {
        self.status.lock().clone()
    }

    pub fn subscribe(&self) -> UnboundedReceiver<DataSourceStatus> {
        self.broadcaster.subscribe()
    }

    pub fn update_status(&self, new_state: State, error: Option<ErrorInfo>) {
        // The lock is held while broadcasting so subscribers see transitions in order.
        let mut status = self.status.lock();
        if status.state == State::Off {
            return;
        }

        let new_state = match (status.state, new_state) {
            (State::Initializing, State::Interrupted) => State::Initializing,
            (_, state) => state,
        };
        if new_state == status.state && error.is_none() {
            return;
        }

        if new_state != status.state {
            status.state = new_state;
            status.state_since = Utc::now();
        }
        if error.is_some() {
            status.last_error = error;
        }
        self.broadcaster.broadcast(status.clone());
    }

    /// Waits until the status reaches `desired`, returning false if it reaches [State::Off]
    /// instead or `timeout` elapses first.
    pub async fn wait_for(&self, desired: State, timeout: Duration) -> bool {
        let mut updates = self.subscribe();
        match self.status().state {
            state if state == desired => return true,
            State::Off => return false,
            _ => (),
        }

        let wait = async {
            while let Some(status) = updates.recv().await {
                if status.state == desired {
                    return true;
                }
                if status.state == State::Off {
                    return false;
                }
            }
            false
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }
}

impl Default for DataSourceStatusProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;
    use std::sync::Arc;

    fn network_error() -> Option<ErrorInfo> {
        Some(ErrorInfo::new(ErrorKind::NetworkError, "connection reset"))
    }

    #[test]
    fn starts_initializing() {
        let provider = DataSourceStatusProvider::new();
        let status = provider.status();
        assert_that!(status.state).is_equal_to(State::Initializing);
        assert_that!(status.last_error).is_none();
    }

    #[test]
    fn interruption_before_first_success_stays_initializing() {
        let provider = DataSourceStatusProvider::new();
        let mut updates = provider.subscribe();

        provider.update_status(State::Interrupted, network_error());

        let status = provider.status();
        assert_that!(status.state).is_equal_to(State::Initializing);
        assert_that!(status.last_error.map(|e| e.kind)).is_equal_to(Some(ErrorKind::NetworkError));
        assert_that!(updates.try_recv().map(|s| s.state).ok())
            .is_equal_to(Some(State::Initializing));
    }

    #[test]
    fn interruption_after_success_is_reported() {
        let provider = DataSourceStatusProvider::new();
        provider.update_status(State::Valid, None);
        provider.update_status(State::Interrupted, network_error());
        assert_that!(provider.status().state).is_equal_to(State::Interrupted);

        provider.update_status(State::Valid, None);
        let status = provider.status();
        assert_that!(status.state).is_equal_to(State::Valid);
        assert_that!(status.last_error).is_some();
    }

    #[test]
    fn off_is_terminal() {
        let provider = DataSourceStatusProvider::new();
        provider.update_status(State::Off, None);
        provider.update_status(State::Valid, None);
        provider.update_status(State::Interrupted, network_error());

        let status = provider.status();
        assert_that!(status.state).is_equal_to(State::Off);
        assert_that!(status.last_error).is_none();
    }

    #[test]
    fn repeated_state_without_error_is_not_broadcast() {
        let provider = DataSourceStatusProvider::new();
        let mut updates = provider.subscribe();

        provider.update_status(State::Valid, None);
        provider.update_status(State::Valid, None);

        assert_that!(updates.try_recv().is_ok()).is_true();
        assert_that!(updates.try_recv().is_err()).is_true();
    }

    #[test]
    fn subscribers_see_transitions_in_order() {
        let provider = DataSourceStatusProvider::new();
        let mut updates = provider.subscribe();

        provider.update_status(State::Valid, None);
        provider.update_status(State::Interrupted, network_error());
        provider.update_status(State::Valid, None);
        provider.update_status(State::Off, None);

        let mut states = vec![];
        while let Ok(status) = updates.try_recv() {
            states.push(status.state);
        }
        assert_that!(states).is_equal_to(vec![
            State::Valid,
            State::Interrupted,
            State::Valid,
            State::Off,
        ]);
    }

    #[tokio::test]
    async fn wait_for_resolves_on_transition() {
        let provider = Arc::new(DataSourceStatusProvider::new());
        let updater = provider.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            updater.update_status(State::Valid, None);
        });

        assert_that!(provider.wait_for(State::Valid, Duration::from_secs(1)).await).is_true();
    }

    #[tokio::test]
    async fn wait_for_gives_up_on_off_or_timeout() {
        let provider = DataSourceStatusProvider::new();
        assert_that!(provider.wait_for(State::Valid, Duration::from_millis(10)).await).is_false();

        provider.update_status(State::Off, None);
        assert_that!(provider.wait_for(State::Valid, Duration::from_secs(1)).await).is_false();
    }
}
