use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};

use crate::big_segments::{BigSegmentStoreWrapper, BigSegmentsStatus, Membership};
use crate::config::{
    ConfigError, DataSystemConfig, DataSystemMode, PersistentStoreConfig, PollingConfig,
    StreamingConfig,
};
use crate::data_source::{
    DataSource, DataSourceStatusProvider, DataSourceUpdateSink, NullDataSource,
    PollingDataSource, State, StreamingDataSource,
};
use crate::stores::{
    DataStore, DataStoreStatusProvider, InMemoryDataStore, PersistentDataStoreWrapper,
};

/// A streaming primary with a polling source held in reserve.
struct Fallback {
    streaming: Arc<StreamingDataSource>,
    polling: Arc<PollingDataSource>,
    after: Duration,
}

/// DataSystem wires a data store, the data sources that feed it and the optional big segment
/// store together according to a [DataSystemConfig].
///
/// Nothing touches the network until [DataSystem::start] is called.
pub struct DataSystem {
    store: Arc<dyn DataStore>,
    data_source_status: Arc<DataSourceStatusProvider>,
    data_store_status: Arc<DataStoreStatusProvider>,
    primary: Arc<dyn DataSource>,
    fallback: Option<Fallback>,
    store_is_authoritative: bool,
    big_segments: Option<Arc<BigSegmentStoreWrapper>>,
    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl DataSystem {
    pub fn new(config: DataSystemConfig) -> Result<Self, ConfigError> {
        let (store, data_store_status) = match &config.mode {
            DataSystemMode::Daemon(persistent)
            | DataSystemMode::PersistentStore {
                store: persistent, ..
            } => persistent_store(persistent),
            _ => {
                let store: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
                (store, Arc::new(DataStoreStatusProvider::new(false)))
            }
        };

        let data_source_status = Arc::new(DataSourceStatusProvider::new());
        let sink = Arc::new(DataSourceUpdateSink::new(
            store.clone(),
            data_source_status.clone(),
            data_store_status.clone(),
        ));

        let mut fallback = None;
        let primary: Arc<dyn DataSource> = match &config.mode {
            DataSystemMode::Streaming(streaming)
            | DataSystemMode::PersistentStore { streaming, .. } => {
                let (primary, reserve) = streaming_with_fallback(&config, sink, streaming)?;
                fallback = reserve;
                primary
            }
            DataSystemMode::Polling(polling) => Arc::new(PollingDataSource::new(
                sink,
                &config.sdk_key,
                &config.endpoints,
                &config.http,
                polling,
            )?),
            DataSystemMode::ExternalUpdatesOnly | DataSystemMode::Daemon(_) => {
                info!("Not fetching flag data; the data store is kept up to date externally");
                Arc::new(NullDataSource::new(sink))
            }
        };

        let big_segments = config.big_segments.map(|setup| {
            Arc::new(BigSegmentStoreWrapper::new(setup.store, setup.config))
        });

        let (shutdown, _) = broadcast::channel(1);
        Ok(Self {
            store,
            data_source_status,
            data_store_status,
            primary,
            fallback,
            store_is_authoritative: matches!(config.mode, DataSystemMode::Daemon(_)),
            big_segments,
            shutdown,
            closed: AtomicBool::new(false),
        })
    }

    /// Starts the configured data source. The returned channel is signalled once the data
    /// system has received its first full data set or has given up trying.
    pub fn start(&self) -> oneshot::Receiver<()> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let fallback = match &self.fallback {
            Some(fallback) => fallback,
            None => {
                self.primary.start(ready_tx);
                return ready_rx;
            }
        };

        let (primary_tx, primary_rx) = oneshot::channel();
        self.primary.start(primary_tx);
        match Handle::try_current() {
            Ok(handle) => {
                let monitor = FallbackMonitor {
                    status: self.data_source_status.clone(),
                    streaming: fallback.streaming.clone(),
                    polling: fallback.polling.clone(),
                    after: fallback.after,
                };
                let shutdown = self.shutdown.subscribe();
                handle.spawn(monitor.run(primary_rx, ready_tx, shutdown));
            }
            // The primary has already reported itself off and released its ready channel.
            Err(_) => {
                let _ = ready_tx.send(());
            }
        }
        ready_rx
    }

    pub fn store(&self) -> Arc<dyn DataStore> {
        self.store.clone()
    }

    pub fn data_source_status_provider(&self) -> Arc<DataSourceStatusProvider> {
        self.data_source_status.clone()
    }

    pub fn data_store_status_provider(&self) -> Arc<DataStoreStatusProvider> {
        self.data_store_status.clone()
    }

    pub fn big_segments(&self) -> Option<&Arc<BigSegmentStoreWrapper>> {
        self.big_segments.as_ref()
    }

    /// Looks up big segment membership for a context, reporting
    /// [BigSegmentsStatus::NotConfigured] when no big segment store was configured.
    pub fn big_segment_membership(
        &self,
        context_key: &str,
    ) -> (Option<Arc<Membership>>, BigSegmentsStatus) {
        match &self.big_segments {
            Some(wrapper) => wrapper.get_membership(context_key),
            None => (None, BigSegmentsStatus::NotConfigured),
        }
    }

    /// True once flag data is available. In daemon mode this is whether the persistent store
    /// has been populated by whoever owns it.
    pub fn is_initialized(&self) -> bool {
        if self.store_is_authoritative {
            return self.store.is_initialized();
        }
        self.primary.is_initialized()
            || self
                .fallback
                .as_ref()
                .map_or(false, |fallback| fallback.polling.is_initialized())
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing data system");
        let _ = self.shutdown.send(());
        self.primary.close();
        if let Some(fallback) = &self.fallback {
            fallback.polling.close();
        }
        if let Some(big_segments) = &self.big_segments {
            big_segments.close();
        }
        if let Err(e) = self.store.close() {
            error!("Error closing data store: {}", e);
        }
    }
}

impl Drop for DataSystem {
    fn drop(&mut self) {
        self.close();
    }
}

fn persistent_store(
    config: &PersistentStoreConfig,
) -> (Arc<dyn DataStore>, Arc<DataStoreStatusProvider>) {
    let wrapper = PersistentDataStoreWrapper::new(config.store.clone(), config.cache);
    let status = wrapper.status_provider();
    (Arc::new(wrapper), status)
}

fn streaming_with_fallback(
    config: &DataSystemConfig,
    sink: Arc<DataSourceUpdateSink>,
    streaming: &StreamingConfig,
) -> Result<(Arc<dyn DataSource>, Option<Fallback>), ConfigError> {
    let primary = Arc::new(StreamingDataSource::new(
        sink.clone(),
        &config.sdk_key,
        &config.endpoints,
        &config.http,
        streaming,
    )?);

    let after = match streaming.fallback_after {
        Some(after) => after,
        None => return Ok((primary, None)),
    };
    let polling_config = PollingConfig {
        payload_filter: streaming.payload_filter.clone(),
        ..Default::default()
    };
    let polling = Arc::new(PollingDataSource::new(
        sink,
        &config.sdk_key,
        &config.endpoints,
        &config.http,
        &polling_config,
    )?);

    let fallback = Fallback {
        streaming: primary.clone(),
        polling,
        after,
    };
    Ok((primary, Some(fallback)))
}

struct FallbackMonitor {
    status: Arc<DataSourceStatusProvider>,
    streaming: Arc<StreamingDataSource>,
    polling: Arc<PollingDataSource>,
    after: Duration,
}

async fn sleep_if_some(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

impl FallbackMonitor {
    /// Forwards the stream's readiness, and swaps the stream for polling once it has been
    /// failing for longer than `after`. A stream that has never connected counts as failing as
    /// soon as it reports an error.
    async fn run(
        self,
        mut primary_ready: oneshot::Receiver<()>,
        ready: oneshot::Sender<()>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ready = Some(ready);
        let mut updates = self.status.subscribe();

        loop {
            let current = self.status.status();
            let failing = match current.state {
                State::Off => break,
                State::Interrupted => true,
                State::Initializing => current.last_error.is_some(),
                State::Valid => false,
            };
            let remaining = if failing {
                let elapsed = (Utc::now() - current.state_since)
                    .to_std()
                    .unwrap_or_default();
                Some(self.after.saturating_sub(elapsed))
            } else {
                None
            };

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = &mut primary_ready, if ready.is_some() => {
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(());
                    }
                }
                update = updates.recv() => {
                    if update.is_none() {
                        break;
                    }
                }
                _ = sleep_if_some(remaining) => {
                    warn!(
                        "Stream has been failing for more than {:?}; falling back to polling",
                        self.after
                    );
                    self.streaming.stop();
                    let ready = ready.take().unwrap_or_else(|| oneshot::channel().0);
                    self.polling.start(ready);
                    return;
                }
            }
        }

        if let Some(ready) = ready.take() {
            let _ = ready.send(());
        }
    }
}
