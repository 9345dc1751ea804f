use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error};

use super::status::{DataSourceStatusProvider, ErrorInfo, ErrorKind, State};
use crate::stores::{
    AllData, DataKind, DataStore, DataStoreError, DataStoreStatusProvider, ItemDescriptor,
};

/// DataSourceUpdateSink is the only path by which data sources change anything: it applies
/// updates to the store and records status transitions.
///
/// A store write failure is reported as [State::Interrupted] with [ErrorKind::StoreError] once
/// per run of failures; the next successful write ends the run.
pub struct DataSourceUpdateSink {
    store: Arc<dyn DataStore>,
    status: Arc<DataSourceStatusProvider>,
    store_status: Arc<DataStoreStatusProvider>,
    last_write_failed: AtomicBool,
}

impl DataSourceUpdateSink {
    pub fn new(
        store: Arc<dyn DataStore>,
        status: Arc<DataSourceStatusProvider>,
        store_status: Arc<DataStoreStatusProvider>,
    ) -> Self {
        Self {
            store,
            status,
            store_status,
            last_write_failed: AtomicBool::new(false),
        }
    }

    /// Replaces the store contents with a full snapshot. Returns false if the store failed.
    pub fn init(&self, all_data: AllData) -> bool {
        let result = self.store.init(all_data);
        self.check_write(result, || "initializing the data store".to_string())
    }

    /// Applies a single versioned update. Returns false only if the store failed; an update
    /// rejected for being out of date is not a failure.
    pub fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> bool {
        let result = self.store.upsert(kind, key, item);
        if let Ok(false) = result {
            debug!("Ignored out-of-date update of {} \"{}\"", kind, key);
        }
        self.check_write(result, || format!("updating \"{}\" in {}", key, kind))
    }

    pub fn update_status(&self, state: State, error: Option<ErrorInfo>) {
        self.status.update_status(state, error);
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub fn status_provider(&self) -> &Arc<DataSourceStatusProvider> {
        &self.status
    }

    pub fn data_store_status_provider(&self) -> &Arc<DataStoreStatusProvider> {
        &self.store_status
    }

    fn check_write<T>(
        &self,
        result: Result<T, DataStoreError>,
        operation: impl FnOnce() -> String,
    ) -> bool {
        match result {
            Ok(_) => {
                self.last_write_failed.store(false, Ordering::SeqCst);
                true
            }
            Err(e) => {
                if !self.last_write_failed.swap(true, Ordering::SeqCst) {
                    let message = format!("error {}: {}", operation(), e);
                    error!("Data store failure, {}", message);
                    self.status.update_status(
                        State::Interrupted,
                        Some(ErrorInfo::new(ErrorKind::StoreError, message)),
                    );
                }
                false
            }
        }
    }
}
