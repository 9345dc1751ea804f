mod backoff;
mod events;
mod polling;
mod sse;
mod status;
mod streaming;
mod update_sink;

pub use polling::PollingDataSource;
pub use status::{DataSourceStatus, DataSourceStatusProvider, ErrorInfo, ErrorKind, State};
pub use streaming::StreamingDataSource;
pub use update_sink::DataSourceUpdateSink;

use std::sync::Arc;

use log::error;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

/// DataSource is a background component that keeps the data store up to date.
pub trait DataSource: Send + Sync {
    /// Starts the background task and returns immediately. `ready` is signalled once, when the
    /// source has either received its first full data set or given up for good.
    fn start(&self, ready: oneshot::Sender<()>);

    /// True once the source has successfully delivered a full data set.
    fn is_initialized(&self) -> bool;

    /// Stops the background task. The source stops writing to the store and reports
    /// [State::Off].
    fn close(&self);
}

/// A data source that never fetches anything, for configurations where something outside the
/// SDK writes to the store.
pub struct NullDataSource {
    sink: Arc<DataSourceUpdateSink>,
}

impl NullDataSource {
    pub fn new(sink: Arc<DataSourceUpdateSink>) -> Self {
        Self { sink }
    }
}

impl DataSource for NullDataSource {
    fn start(&self, ready: oneshot::Sender<()>) {
        self.sink.update_status(State::Valid, None);
        let _ = ready.send(());
    }

    fn is_initialized(&self) -> bool {
        true
    }

    fn close(&self) {
        self.sink.update_status(State::Off, None);
    }
}

/// Holds the ready channel of a running source so that it is signalled at most once.
#[derive(Default)]
pub(crate) struct ReadyNotifier {
    sender: Mutex<Option<oneshot::Sender<()>>>,
}

impl ReadyNotifier {
    pub fn set(&self, sender: oneshot::Sender<()>) {
        *self.sender.lock() = Some(sender);
    }

    pub fn notify(&self) {
        if let Some(sender) = self.sender.lock().take() {
            let _ = sender.send(());
        }
    }
}

/// The runtime to spawn background tasks on. Without one, the source cannot run at all, so it
/// is switched off and its ready channel released.
pub(crate) fn runtime_handle(sink: &DataSourceUpdateSink, ready: &ReadyNotifier) -> Option<Handle> {
    match Handle::try_current() {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!("Data source cannot start outside of a tokio runtime: {}", e);
            sink.update_status(
                State::Off,
                Some(ErrorInfo::new(ErrorKind::Unknown, e.to_string())),
            );
            ready.notify();
            None
        }
    }
}
