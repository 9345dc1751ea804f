use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, oneshot};
use tokio::time::MissedTickBehavior;

use super::status::{ErrorInfo, State};
use super::update_sink::DataSourceUpdateSink;
use super::{runtime_handle, DataSource, ReadyNotifier};
use crate::config::{ConfigError, HttpConfig, PollingConfig, ServiceEndpoints};
use crate::feature_requester::{FeatureRequester, Fetched};

struct PollingInner {
    sink: Arc<DataSourceUpdateSink>,
    requester: FeatureRequester,
    poll_interval: Duration,
    initialized: AtomicBool,
    ready: ReadyNotifier,
}

/// PollingDataSource fetches the full data set on a fixed interval, starting immediately.
pub struct PollingDataSource {
    inner: Arc<PollingInner>,
    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl PollingDataSource {
    pub fn new(
        sink: Arc<DataSourceUpdateSink>,
        sdk_key: &str,
        endpoints: &ServiceEndpoints,
        http: &HttpConfig,
        config: &PollingConfig,
    ) -> Result<Self, ConfigError> {
        let requester =
            FeatureRequester::new(sdk_key, endpoints, http, config.effective_payload_filter())?;
        Ok(Self::with_requester(
            sink,
            requester,
            config.effective_poll_interval(),
        ))
    }

    pub(crate) fn with_requester(
        sink: Arc<DataSourceUpdateSink>,
        requester: FeatureRequester,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(PollingInner {
                sink,
                requester,
                poll_interval,
                initialized: AtomicBool::new(false),
                ready: ReadyNotifier::default(),
            }),
            shutdown,
            closed: AtomicBool::new(false),
        }
    }
}

impl DataSource for PollingDataSource {
    fn start(&self, ready: oneshot::Sender<()>) {
        self.inner.ready.set(ready);
        if self.closed.load(Ordering::SeqCst) {
            self.inner.ready.notify();
            return;
        }
        if let Some(handle) = runtime_handle(&self.inner.sink, &self.inner.ready) {
            let inner = self.inner.clone();
            let shutdown = self.shutdown.subscribe();
            handle.spawn(async move { inner.run(shutdown).await });
        }
    }

    fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown.send(());
            self.inner.sink.update_status(State::Off, None);
        }
    }
}

impl PollingInner {
    async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!("Starting polling every {:?}", self.poll_interval);
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // The first tick completes immediately.
            let keep_polling = tokio::select! {
                _ = shutdown.recv() => break,
                keep_polling = async {
                    interval.tick().await;
                    self.poll().await
                } => keep_polling,
            };
            if !keep_polling {
                break;
            }
        }

        debug!("Polling task finished");
        self.ready.notify();
    }

    /// Performs one fetch. Returns false once polling should stop for good.
    async fn poll(&self) -> bool {
        match self.requester.request_all().await {
            Ok(Fetched::Data(all_data)) => {
                if self.sink.init(all_data) {
                    if !self.initialized.swap(true, Ordering::SeqCst) {
                        info!("First polling request successful");
                        self.ready.notify();
                    }
                    self.sink.update_status(State::Valid, None);
                }
                true
            }
            Ok(Fetched::NotModified) => {
                if self.initialized.load(Ordering::SeqCst) {
                    self.sink.update_status(State::Valid, None);
                }
                true
            }
            Err(e) => {
                let info = ErrorInfo::from_request_error(&e);
                if e.is_recoverable() {
                    warn!("Error on polling request (will retry): {}", e);
                    self.sink.update_status(State::Interrupted, Some(info));
                    true
                } else {
                    error!("Error on polling request (giving up permanently): {}", e);
                    self.sink.update_status(State::Off, Some(info));
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_source::{DataSourceStatusProvider, ErrorKind};
    use crate::flag::Flag;
    use crate::stores::{DataStore, DataStoreStatusProvider, InMemoryDataStore, FEATURES};
    use crate::test_common::BASIC_PAYLOAD;
    use spectral::prelude::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        store: Arc<InMemoryDataStore>,
        status: Arc<DataSourceStatusProvider>,
        source: PollingDataSource,
    }

    fn fixture(server: &MockServer, poll_interval: Duration) -> Fixture {
        let store = Arc::new(InMemoryDataStore::new());
        let status = Arc::new(DataSourceStatusProvider::new());
        let sink = Arc::new(DataSourceUpdateSink::new(
            store.clone(),
            status.clone(),
            Arc::new(DataStoreStatusProvider::new(false)),
        ));
        let requester = FeatureRequester::new(
            "sdk-key",
            &ServiceEndpoints::relay(&server.uri()),
            &HttpConfig::default(),
            None,
        )
        .unwrap();
        Fixture {
            store,
            status,
            source: PollingDataSource::with_requester(sink, requester, poll_interval),
        }
    }

    async fn start(fixture: &Fixture) {
        let (tx, rx) = oneshot::channel();
        fixture.source.start(tx);
        tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
    }

    async fn wait_for_requests(server: &MockServer, count: usize) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while server.received_requests().await.unwrap().len() < count {
            assert!(tokio::time::Instant::now() < deadline, "expected {} requests", count);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn first_poll_is_immediate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sdk/latest-all"))
            .respond_with(ResponseTemplate::new(200).set_body_string(BASIC_PAYLOAD))
            .mount(&server)
            .await;

        // The interval is long enough that only the immediate poll can have happened.
        let fixture = fixture(&server, Duration::from_secs(3600));
        start(&fixture).await;

        assert_that!(fixture.source.is_initialized()).is_true();
        assert_that!(fixture.store.is_initialized()).is_true();
        let flag = fixture.store.get(FEATURES, "my-flag").unwrap().unwrap();
        assert_that!(flag.version).is_equal_to(2);
        assert_that!(fixture.status.status().state).is_equal_to(State::Valid);
        fixture.source.close();
    }

    #[tokio::test]
    async fn not_modified_keeps_data_and_stays_valid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("if-none-match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", "\"v1\"")
                    .set_body_string(BASIC_PAYLOAD),
            )
            .mount(&server)
            .await;

        let fixture = fixture(&server, Duration::from_millis(20));
        start(&fixture).await;

        // a local change made after the full payload must outlive the unchanged polls
        let updated = fixture
            .store
            .upsert(FEATURES, "my-flag", Flag::new_with_version("my-flag", 5).into())
            .unwrap();
        assert_that!(updated).is_true();
        let seen = server.received_requests().await.unwrap().len();
        wait_for_requests(&server, seen + 2).await;

        let flag = fixture.store.get(FEATURES, "my-flag").unwrap();
        assert_that!(flag.map(|item| item.version)).is_equal_to(Some(5));
        let status = fixture.status.status();
        assert_that!(status.state).is_equal_to(State::Valid);
        assert_that!(status.last_error).is_none();
        fixture.source.close();
    }

    #[tokio::test]
    async fn recoverable_error_keeps_polling() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(BASIC_PAYLOAD))
            .mount(&server)
            .await;

        let fixture = fixture(&server, Duration::from_millis(20));
        start(&fixture).await;

        assert_that!(fixture.source.is_initialized()).is_true();
        let status = fixture.status.status();
        assert_that!(status.state).is_equal_to(State::Valid);
        assert_that!(status.last_error.and_then(|e| e.status_code)).is_equal_to(Some(503));
        fixture.source.close();
    }

    #[tokio::test]
    async fn unrecoverable_error_stops_polling() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let fixture = fixture(&server, Duration::from_millis(20));
        start(&fixture).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_that!(fixture.source.is_initialized()).is_false();
        let status = fixture.status.status();
        assert_that!(status.state).is_equal_to(State::Off);
        assert_that!(status.last_error.map(|e| e.kind)).is_equal_to(Some(ErrorKind::ErrorResponse));
    }

    #[tokio::test]
    async fn close_stops_polling() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(BASIC_PAYLOAD))
            .mount(&server)
            .await;

        let fixture = fixture(&server, Duration::from_millis(20));
        start(&fixture).await;
        fixture.source.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let requests = server.received_requests().await.unwrap().len();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_that!(server.received_requests().await.unwrap().len()).is_equal_to(requests);
        assert_that!(fixture.status.status().state).is_equal_to(State::Off);
    }
}
