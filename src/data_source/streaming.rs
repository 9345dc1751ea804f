use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tokio::sync::{broadcast, mpsc::UnboundedReceiver, oneshot};

use super::backoff::Backoff;
use super::events::{parse_event, StreamEvent};
use super::sse::{SseEvent, SseParser};
use super::status::{ErrorInfo, State};
use super::update_sink::DataSourceUpdateSink;
use super::{runtime_handle, DataSource, ReadyNotifier};
use crate::config::{ConfigError, HttpConfig, ServiceEndpoints, StreamingConfig};
use crate::feature_requester::{FeatureRequester, Fetched};
use crate::http::{streaming_client, RequestError};
use crate::stores::DataStoreStatus;

const STREAM_PATH: &str = "/all";

/// What the reconnect loop does after a connection ends.
enum Flow {
    Restart,
    Stop,
}

struct StreamingInner {
    sink: Arc<DataSourceUpdateSink>,
    client: reqwest::Client,
    stream_url: String,
    filter: Option<String>,
    requester: FeatureRequester,
    initial_reconnect_delay: Duration,
    read_timeout: Duration,
    initialized: AtomicBool,
    ready: ReadyNotifier,
}

/// StreamingDataSource keeps a long-lived connection to the streaming service and applies the
/// `put`, `patch`, `delete` and `indirect/*` events it receives.
///
/// Failed connections are retried with [Backoff] unless the failure is unrecoverable, in which
/// case the source reports [State::Off] and stops.
pub struct StreamingDataSource {
    inner: Arc<StreamingInner>,
    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl StreamingDataSource {
    pub fn new(
        sink: Arc<DataSourceUpdateSink>,
        sdk_key: &str,
        endpoints: &ServiceEndpoints,
        http: &HttpConfig,
        config: &StreamingConfig,
    ) -> Result<Self, ConfigError> {
        let filter = config.effective_payload_filter();
        let (shutdown, _) = broadcast::channel(1);
        Ok(Self {
            inner: Arc::new(StreamingInner {
                sink,
                client: streaming_client(sdk_key, http)?,
                stream_url: format!("{}{}", endpoints.streaming(), STREAM_PATH),
                requester: FeatureRequester::new(sdk_key, endpoints, http, filter.clone())?,
                filter,
                initial_reconnect_delay: config.effective_initial_reconnect_delay(),
                read_timeout: http.read_timeout,
                initialized: AtomicBool::new(false),
                ready: ReadyNotifier::default(),
            }),
            shutdown,
            closed: AtomicBool::new(false),
        })
    }

    /// Ends the stream without reporting [State::Off], so that another source can take over
    /// the shared status.
    pub(crate) fn stop(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown.send(());
        }
    }
}

impl DataSource for StreamingDataSource {
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

/// Resolves when the store reports that it recovered from an outage and may have missed
/// updates. Never resolves for stores that cannot report outages.
async fn refresh_requested(updates: &mut Option<UnboundedReceiver<DataStoreStatus>>) {
    if let Some(updates) = updates {
        while let Some(status) = updates.recv().await {
            if status.available && status.needs_refresh {
                return;
            }
        }
    }
    std::future::pending().await
}

impl StreamingInner {
    async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut backoff = Backoff::new(self.initial_reconnect_delay);
        let store_status = self.sink.data_store_status_provider();
        let mut store_updates = if store_status.is_status_monitoring_enabled() {
            Some(store_status.subscribe())
        } else {
            None
        };

        loop {
            let flow = tokio::select! {
                _ = shutdown.recv() => break,
                flow = self.consume_stream(&mut backoff) => flow,
                _ = refresh_requested(&mut store_updates) => {
                    warn!("Restarting stream to refresh data after data store outage");
                    Flow::Restart
                }
            };
            if let Flow::Stop = flow {
                break;
            }

            let delay = backoff.next_delay();
            info!("Reconnecting to stream in {:?}", delay);
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(delay) => (),
            }
        }

        debug!("Stream task finished");
        self.ready.notify();
    }

    async fn consume_stream(&self, backoff: &mut Backoff) -> Flow {
        let mut request = self
            .client
            .get(&self.stream_url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(filter) = &self.filter {
            request = request.query(&[("filter", filter)]);
        }

        info!("Connecting to stream at {}", self.stream_url);
        let response = match tokio::time::timeout(self.read_timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return self.handle_error(e.into()),
            Err(_) => return self.handle_error(self.idle_timeout_error()),
        };
        if !response.status().is_success() {
            return self.handle_error(RequestError::UnexpectedStatus {
                status: response.status().as_u16(),
            });
        }
        backoff.connected();

        let mut body = response.bytes_stream();
        let mut parser = SseParser::new();
        loop {
            let chunk = tokio::time::timeout(self.read_timeout, body.next()).await;
            let bytes = match chunk {
                Err(_) => return self.handle_error(self.idle_timeout_error()),
                Ok(None) => {
                    return self.handle_error(RequestError::Network(
                        "stream closed by server".to_string(),
                    ))
                }
                Ok(Some(Err(e))) => return self.handle_error(e.into()),
                Ok(Some(Ok(bytes))) => bytes,
            };

            for event in parser.parse(&bytes) {
                if let Some(flow) = self.process_event(event).await {
                    return flow;
                }
            }
        }
    }

    /// Applies one event. Returns `Some` if the connection has to end.
    async fn process_event(&self, event: SseEvent) -> Option<Flow> {
        let event = match parse_event(&event) {
            Ok(Some(event)) => event,
            Ok(None) => return None,
            Err(e) => {
                warn!("Received invalid data in \"{}\" event: {}", event.event, e);
                self.sink
                    .update_status(State::Interrupted, Some(ErrorInfo::from_request_error(&e)));
                return Some(Flow::Restart);
            }
        };

        let stored = match event {
            StreamEvent::Put(all_data) => {
                let stored = self.sink.init(all_data);
                if stored {
                    self.set_initialized();
                }
                stored
            }
            StreamEvent::Patch { kind, key, item } => self.sink.upsert(kind, &key, item),
            StreamEvent::Delete { kind, key, version } => {
                self.sink.upsert(kind, &key, kind.make_deleted(&key, version))
            }
            StreamEvent::IndirectPut => {
                info!("Received indirect put; fetching full data set");
                match self.requester.request_all().await {
                    Ok(Fetched::Data(all_data)) => {
                        let stored = self.sink.init(all_data);
                        if stored {
                            self.set_initialized();
                        }
                        stored
                    }
                    Ok(Fetched::NotModified) => true,
                    Err(e) => return Some(self.handle_indirect_error(e)),
                }
            }
            StreamEvent::IndirectPatch { kind, key } => {
                info!("Received indirect patch; fetching {} \"{}\"", kind, key);
                match self.requester.request_item(kind, &key).await {
                    Ok(item) => self.sink.upsert(kind, &key, item),
                    Err(e) => return Some(self.handle_indirect_error(e)),
                }
            }
        };

        if stored {
            self.sink.update_status(State::Valid, None);
            None
        } else if self.sink.data_store_status_provider().is_status_monitoring_enabled() {
            // The store will ask for a refresh once it recovers.
            None
        } else {
            Some(Flow::Restart)
        }
    }

    fn set_initialized(&self) {
        if !self.initialized.swap(true, Ordering::SeqCst) {
            info!("Stream delivered initial data");
            self.ready.notify();
        }
    }

    fn idle_timeout_error(&self) -> RequestError {
        RequestError::Network(format!("no data received for {:?}", self.read_timeout))
    }

    fn handle_indirect_error(&self, err: RequestError) -> Flow {
        warn!("Error fetching data for indirect stream event (will restart stream): {}", err);
        self.sink
            .update_status(State::Interrupted, Some(ErrorInfo::from_request_error(&err)));
        Flow::Restart
    }

    fn handle_error(&self, err: RequestError) -> Flow {
        let info = ErrorInfo::from_request_error(&err);
        if err.is_recoverable() {
            warn!("Error in stream connection (will retry): {}", err);
            self.sink.update_status(State::Interrupted, Some(info));
            Flow::Restart
        } else {
            error!("Error in stream connection (giving up permanently): {}", err);
            self.sink.update_status(State::Off, Some(info));
            Flow::Stop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_source::{DataSourceStatusProvider, ErrorKind};
    use crate::flag::Flag;
    use crate::stores::{
        CacheMode, DataStore, DataStoreStatusProvider, InMemoryDataStore,
        PersistentDataStoreWrapper, FEATURES, SEGMENTS,
    };
    use crate::test_common::{sse_event, BackendStyle, MockPersistentStore, BASIC_PUT, MY_FLAG_V3};
    use spectral::prelude::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const WAIT: Duration = Duration::from_secs(5);

    fn stream_response(body: String) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/event-stream")
            .set_body_string(body)
    }

    /// Every connection made after the ones already mounted hangs without a response.
    async fn mount_idle_stream(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/all"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(60)))
            .mount(server)
            .await;
    }

    /// Serves `body` on the first connection only; later connections hang.
    async fn mount_stream_once(server: &MockServer, body: String) {
        Mock::given(method("GET"))
            .and(path("/all"))
            .respond_with(stream_response(body))
            .up_to_n_times(1)
            .mount(server)
            .await;
        mount_idle_stream(server).await;
    }

    struct Fixture {
        store: Arc<dyn DataStore>,
        status: Arc<DataSourceStatusProvider>,
        source: StreamingDataSource,
    }

    fn fixture_with(
        server: &MockServer,
        store: Arc<dyn DataStore>,
        store_status: Arc<DataStoreStatusProvider>,
        http: HttpConfig,
        config: StreamingConfig,
    ) -> Fixture {
        let status = Arc::new(DataSourceStatusProvider::new());
        let sink = Arc::new(DataSourceUpdateSink::new(
            store.clone(),
            status.clone(),
            store_status,
        ));
        let source = StreamingDataSource::new(
            sink,
            "sdk-key",
            &ServiceEndpoints::relay(&server.uri()),
            &http,
            &config,
        )
        .unwrap();
        Fixture {
            store,
            status,
            source,
        }
    }

    fn fast_reconnect() -> StreamingConfig {
        StreamingConfig {
            initial_reconnect_delay: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn fixture(server: &MockServer) -> Fixture {
        fixture_with(
            server,
            Arc::new(InMemoryDataStore::new()),
            Arc::new(DataStoreStatusProvider::new(false)),
            HttpConfig::default(),
            fast_reconnect(),
        )
    }

    async fn start(fixture: &Fixture) {
        let (tx, rx) = oneshot::channel();
        fixture.source.start(tx);
        tokio::time::timeout(WAIT, rx)
            .await
            .expect("data source never became ready")
            .unwrap();
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "condition not reached");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_requests(server: &MockServer, count: usize) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while server.received_requests().await.unwrap().len() < count {
            assert!(tokio::time::Instant::now() < deadline, "expected {} requests", count);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn version_of(store: &Arc<dyn DataStore>, key: &str) -> Option<u64> {
        store.get(FEATURES, key).unwrap().map(|item| item.version)
    }

    fn patch(key: &str, version: u64) -> String {
        format!(
            r#"{{"path": "/flags/{0}", "data": {{"key": "{0}", "version": {1}}}}}"#,
            key, version
        )
    }

    #[tokio::test]
    async fn initial_put_populates_store() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/all"))
            .and(header("accept", "text/event-stream"))
            .and(header("authorization", "sdk-key"))
            .respond_with(stream_response(sse_event("put", BASIC_PUT)))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_idle_stream(&server).await;

        let fixture = fixture(&server);
        start(&fixture).await;

        assert_that!(fixture.source.is_initialized()).is_true();
        assert_that!(fixture.store.is_initialized()).is_true();
        assert_that!(version_of(&fixture.store, "my-flag")).is_equal_to(Some(2));
        let segment = fixture.store.get(SEGMENTS, "my-segment").unwrap().unwrap();
        assert_that!(segment.version).is_equal_to(2);
        fixture.source.close();
    }

    #[tokio::test]
    async fn patches_apply_only_newer_versions() {
        let server = MockServer::start().await;
        let body = [
            sse_event("put", BASIC_PUT),
            sse_event("patch", &patch("my-flag", 3)),
            sse_event("patch", &patch("my-flag", 1)),
        ]
        .concat();
        mount_stream_once(&server, body).await;

        let fixture = fixture(&server);
        start(&fixture).await;
        wait_for_requests(&server, 2).await;
        assert_that!(version_of(&fixture.store, "my-flag")).is_equal_to(Some(3));
        fixture.source.close();
    }

    #[tokio::test]
    async fn delete_leaves_tombstone() {
        let server = MockServer::start().await;
        let body = [
            sse_event("put", BASIC_PUT),
            sse_event("delete", r#"{"path": "/flags/my-flag", "version": 4}"#),
            sse_event("patch", &patch("my-flag", 3)),
        ]
        .concat();
        mount_stream_once(&server, body).await;

        let fixture = fixture(&server);
        start(&fixture).await;
        wait_for_requests(&server, 2).await;
        assert_that!(version_of(&fixture.store, "my-flag")).is_none();
        assert_that!(fixture
            .store
            .upsert(FEATURES, "my-flag", Flag::new_with_version("my-flag", 4).into())
            .unwrap())
        .is_false();
        fixture.source.close();
    }

    #[tokio::test]
    async fn unrecoverable_error_turns_source_off() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let fixture = fixture(&server);
        start(&fixture).await;

        assert_that!(fixture.source.is_initialized()).is_false();
        assert_that!(fixture.store.is_initialized()).is_false();
        let status = fixture.status.status();
        assert_that!(status.state).is_equal_to(State::Off);
        let error = status.last_error.unwrap();
        assert_that!(error.kind).is_equal_to(ErrorKind::ErrorResponse);
        assert_that!(error.status_code).is_equal_to(Some(401));
    }

    #[tokio::test]
    async fn recoverable_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_stream_once(&server, sse_event("put", BASIC_PUT)).await;

        let fixture = fixture(&server);
        let mut updates = fixture.status.subscribe();
        start(&fixture).await;

        assert_that!(fixture.source.is_initialized()).is_true();
        let first = updates.recv().await.unwrap();
        assert_that!(first.state).is_equal_to(State::Initializing);
        assert_that!(first.last_error.and_then(|e| e.status_code)).is_equal_to(Some(500));
        let second = updates.recv().await.unwrap();
        assert_that!(second.state).is_equal_to(State::Valid);
        fixture.source.close();
    }

    #[tokio::test]
    async fn end_of_stream_interrupts_and_reconnects() {
        let server = MockServer::start().await;
        mount_stream_once(&server, sse_event("put", BASIC_PUT)).await;

        let fixture = fixture(&server);
        start(&fixture).await;

        let interrupted = fixture.status.wait_for(State::Interrupted, WAIT).await;
        assert_that!(interrupted).is_true();
        let error = fixture.status.status().last_error.unwrap();
        assert_that!(error.kind).is_equal_to(ErrorKind::NetworkError);
        wait_for_requests(&server, 2).await;
        fixture.source.close();
    }

    #[tokio::test]
    async fn invalid_event_restarts_stream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(stream_response(sse_event("put", "{not json")))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_stream_once(&server, sse_event("put", BASIC_PUT)).await;

        let fixture = fixture(&server);
        let mut updates = fixture.status.subscribe();
        start(&fixture).await;

        assert_that!(fixture.source.is_initialized()).is_true();
        let first = updates.recv().await.unwrap();
        assert_that!(first.last_error.map(|e| e.kind)).is_equal_to(Some(ErrorKind::InvalidData));
        fixture.source.close();
    }

    #[tokio::test]
    async fn indirect_patch_fetches_item() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sdk/latest-flags/my-flag"))
            .respond_with(ResponseTemplate::new(200).set_body_string(MY_FLAG_V3))
            .mount(&server)
            .await;
        let body = [
            sse_event("put", BASIC_PUT),
            sse_event("indirect/patch", "/flags/my-flag"),
        ]
        .concat();
        mount_stream_once(&server, body).await;

        let fixture = fixture(&server);
        start(&fixture).await;
        wait_until(|| version_of(&fixture.store, "my-flag") == Some(3)).await;
        fixture.source.close();
    }

    #[tokio::test]
    async fn indirect_put_fetches_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sdk/latest-all"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(crate::test_common::BASIC_PAYLOAD),
            )
            .mount(&server)
            .await;
        mount_stream_once(&server, sse_event("indirect/put", "")).await;

        let fixture = fixture(&server);
        start(&fixture).await;
        assert_that!(version_of(&fixture.store, "my-flag")).is_equal_to(Some(2));
        fixture.source.close();
    }

    #[tokio::test]
    async fn payload_filter_is_sent_as_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/all"))
            .and(query_param("filter", "microservice-1"))
            .respond_with(stream_response(sse_event("put", BASIC_PUT)))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_idle_stream(&server).await;

        let config = StreamingConfig {
            payload_filter: Some("microservice-1".into()),
            ..fast_reconnect()
        };
        let fixture = fixture_with(
            &server,
            Arc::new(InMemoryDataStore::new()),
            Arc::new(DataStoreStatusProvider::new(false)),
            HttpConfig::default(),
            config,
        );
        start(&fixture).await;
        assert_that!(fixture.source.is_initialized()).is_true();
        fixture.source.close();
    }

    #[tokio::test]
    async fn idle_connection_is_dropped() {
        let server = MockServer::start().await;
        mount_idle_stream(&server).await;

        let http = HttpConfig {
            read_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let fixture = fixture_with(
            &server,
            Arc::new(InMemoryDataStore::new()),
            Arc::new(DataStoreStatusProvider::new(false)),
            http,
            fast_reconnect(),
        );
        let (tx, _rx) = oneshot::channel();
        fixture.source.start(tx);

        wait_for_requests(&server, 2).await;
        let error = fixture.status.status().last_error.unwrap();
        assert_that!(error.kind).is_equal_to(ErrorKind::NetworkError);
        assert_that!(fixture.source.is_initialized()).is_false();
        fixture.source.close();
    }

    #[tokio::test]
    async fn close_releases_ready_and_turns_source_off() {
        let server = MockServer::start().await;
        mount_idle_stream(&server).await;

        let fixture = fixture(&server);
        let (tx, rx) = oneshot::channel();
        fixture.source.start(tx);
        fixture.source.close();

        tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
        assert_that!(fixture.status.status().state).is_equal_to(State::Off);
    }

    #[tokio::test]
    async fn store_recovery_restarts_stream() {
        let server = MockServer::start().await;
        mount_stream_once(&server, sse_event("put", BASIC_PUT)).await;

        let backend = Arc::new(MockPersistentStore::new(BackendStyle::VersionColumn));
        let wrapper = PersistentDataStoreWrapper::with_poll_interval(
            backend.clone(),
            CacheMode::None,
            Duration::from_millis(10),
        );
        let store_status = wrapper.status_provider();
        let fixture = fixture_with(
            &server,
            Arc::new(wrapper),
            store_status.clone(),
            HttpConfig::default(),
            fast_reconnect(),
        );
        start(&fixture).await;
        wait_for_requests(&server, 2).await;

        backend.set_available(false);
        assert_that!(fixture.store.get(FEATURES, "my-flag")).is_err();
        assert_that!(store_status.status().available).is_false();
        backend.set_available(true);

        wait_for_requests(&server, 3).await;
        assert_that!(store_status.status().needs_refresh).is_true();
        fixture.source.close();
    }
}
