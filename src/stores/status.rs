use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::broadcaster::Broadcaster;

/// Information about the availability of a data store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataStoreStatus {
    /// False if the store is known to be failing.
    pub available: bool,
    /// True when the store has just recovered from an outage and may be missing updates that
    /// were received while it was unavailable. Data sources respond by requesting fresh data.
    pub needs_refresh: bool,
}

impl Default for DataStoreStatus {
    fn default() -> Self {
        Self {
            available: true,
            needs_refresh: false,
        }
    }
}

/// DataStoreStatusProvider is the hub through which a store reports outages and recoveries.
///
/// Both the store and the data sources hold a reference to it; neither references the other.
pub struct DataStoreStatusProvider {
    status: RwLock<DataStoreStatus>,
    monitoring_enabled: bool,
    broadcaster: Broadcaster<DataStoreStatus>,
}

impl DataStoreStatusProvider {
    pub fn new(monitoring_enabled: bool) -> Self {
        Self {
            status: RwLock::new(DataStoreStatus::default()),
            monitoring_enabled,
            broadcaster: Broadcaster::new(),
        }
    }

    pub fn status(&self) -> DataStoreStatus {
        *self.status.read()
    }

    /// Whether the store can report outages at all. Stores that cannot (such as the in-memory
    /// store) always report themselves as available.
    pub fn is_status_monitoring_enabled(&self) -> bool {
        self.monitoring_enabled
    }

    pub fn subscribe(&self) -> UnboundedReceiver<DataStoreStatus> {
        self.broadcaster.subscribe()
    }

    /// Records a new status, notifying subscribers only if it differs from the previous one.
    pub fn update_status(&self, new_status: DataStoreStatus) {
        {
            let mut status = self.status.write();
            if *status == new_status {
                return;
            }
            *status = new_status;
        }
        self.broadcaster.broadcast(new_status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;

    #[test]
    fn broadcasts_only_changes() {
        let provider = DataStoreStatusProvider::new(true);
        let mut rx = provider.subscribe();

        provider.update_status(DataStoreStatus::default());
        assert_that!(rx.try_recv().is_err()).is_true();

        let outage = DataStoreStatus {
            available: false,
            needs_refresh: false,
        };
        provider.update_status(outage);
        provider.update_status(outage);
        assert_that!(rx.try_recv().ok()).is_equal_to(Some(outage));
        assert_that!(rx.try_recv().is_err()).is_true();
        assert_that!(provider.status()).is_equal_to(outage);
    }
}
