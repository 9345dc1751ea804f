use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, error, warn};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc::UnboundedReceiver};

use super::cache::MembershipCache;
use super::store::{BigSegmentStore, Membership};
use crate::broadcaster::Broadcaster;
use crate::config::BigSegmentsConfig;
use crate::util::unix_millis_now;

const MIN_STATUS_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Health of the big segment store as seen by the status poller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BigSegmentStoreStatus {
    /// False if the last metadata query failed.
    pub available: bool,
    /// True if the store has not been updated for longer than the configured limit, so its
    /// answers may be out of date.
    pub stale: bool,
}

/// Describes the big segment data behind an evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BigSegmentsStatus {
    Healthy,
    Stale,
    StoreError,
    /// No big segment store was configured.
    NotConfigured,
}

impl From<BigSegmentStoreStatus> for BigSegmentsStatus {
    fn from(status: BigSegmentStoreStatus) -> Self {
        match status {
            BigSegmentStoreStatus {
                available: false, ..
            } => BigSegmentsStatus::StoreError,
            BigSegmentStoreStatus { stale: true, .. } => BigSegmentsStatus::Stale,
            _ => BigSegmentsStatus::Healthy,
        }
    }
}

/// The value a big segment store is queried with for a context: the standard base64 encoding
/// of the SHA-256 digest of the context key.
pub fn hash_context_key(context_key: &str) -> String {
    STANDARD.encode(Sha256::digest(context_key.as_bytes()))
}

struct WrapperInner {
    store: Arc<dyn BigSegmentStore>,
    config: BigSegmentsConfig,
    cache: Mutex<MembershipCache>,
    // The status and when it was computed; `None` until the first metadata query.
    status: Mutex<Option<(BigSegmentStoreStatus, Instant)>>,
    broadcaster: Broadcaster<BigSegmentStoreStatus>,
    polling: AtomicBool,
}

/// BigSegmentStoreWrapper fronts a [BigSegmentStore] with a per-context membership cache and
/// tracks the store's health.
///
/// With a tokio runtime available a background task queries the store metadata every
/// `status_poll_interval`; otherwise the metadata is queried on demand once the last result is
/// that old.
pub struct BigSegmentStoreWrapper {
    inner: Arc<WrapperInner>,
    shutdown: broadcast::Sender<()>,
}

impl BigSegmentStoreWrapper {
    pub fn new(store: Arc<dyn BigSegmentStore>, config: BigSegmentsConfig) -> Self {
        let inner = Arc::new(WrapperInner {
            store,
            cache: Mutex::new(MembershipCache::new(
                config.context_cache_size,
                config.context_cache_time,
            )),
            config,
            status: Mutex::new(None),
            broadcaster: Broadcaster::new(),
            polling: AtomicBool::new(false),
        });
        let (shutdown, _) = broadcast::channel(1);

        match Handle::try_current() {
            Ok(handle) => {
                inner.polling.store(true, Ordering::SeqCst);
                let poller = inner.clone();
                let shutdown = shutdown.subscribe();
                handle.spawn(async move { poller.poll_status_periodically(shutdown).await });
            }
            Err(_) => warn!("No tokio runtime; big segment store status will be checked on demand"),
        }

        Self { inner, shutdown }
    }

    /// Returns the context's membership and the store status to report alongside it.
    pub fn get_membership(
        &self,
        context_key: &str,
    ) -> (Option<Arc<Membership>>, BigSegmentsStatus) {
        let cached = self.inner.cache.lock().get(context_key, Instant::now());
        let membership = match cached {
            Some(membership) => membership,
            None => {
                let hash = hash_context_key(context_key);
                match self.inner.store.get_membership(&hash) {
                    Ok(membership) => {
                        let membership = membership.map(Arc::new);
                        self.inner.cache.lock().insert(
                            context_key.to_string(),
                            membership.clone(),
                            Instant::now(),
                        );
                        membership
                    }
                    Err(e) => {
                        error!("Big segment store returned error: {}", e);
                        return (None, BigSegmentsStatus::StoreError);
                    }
                }
            }
        };
        (membership, self.status().into())
    }

    /// The current store status. Before the first scheduled poll has finished this queries the
    /// store metadata directly.
    pub fn status(&self) -> BigSegmentStoreStatus {
        let current = *self.inner.status.lock();
        match current {
            Some((status, checked_at))
                if self.inner.polling.load(Ordering::SeqCst)
                    || checked_at.elapsed() < self.inner.config.status_poll_interval =>
            {
                status
            }
            _ => self.inner.poll_status(),
        }
    }

    pub fn subscribe(&self) -> UnboundedReceiver<BigSegmentStoreStatus> {
        self.inner.broadcaster.subscribe()
    }

    pub fn clear_cache(&self) {
        self.inner.cache.lock().clear();
    }

    pub fn close(&self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.inner.store.close() {
            warn!("Error closing big segment store: {}", e);
        }
    }
}

impl WrapperInner {
    async fn poll_status_periodically(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval =
            tokio::time::interval(self.config.status_poll_interval.max(MIN_STATUS_POLL_INTERVAL));
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {
                    let inner = self.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || inner.poll_status()).await {
                        error!("Big segment status poll failed: {}", e);
                    }
                }
            }
        }
        self.polling.store(false, Ordering::SeqCst);
        debug!("Big segment status poller finished");
    }

    fn poll_status(&self) -> BigSegmentStoreStatus {
        let new_status = match self.store.get_metadata() {
            Ok(metadata) => BigSegmentStoreStatus {
                available: true,
                stale: self.is_stale(metadata.last_up_to_date),
            },
            Err(e) => {
                error!("Big segment store status query returned error: {}", e);
                BigSegmentStoreStatus {
                    available: false,
                    stale: false,
                }
            }
        };
        self.update_status(new_status);
        new_status
    }

    fn is_stale(&self, last_up_to_date: Option<i64>) -> bool {
        match last_up_to_date {
            Some(updated) => {
                let age = unix_millis_now().saturating_sub(updated);
                age > self.config.stale_after.as_millis() as i64
            }
            None => true,
        }
    }

    fn update_status(&self, new_status: BigSegmentStoreStatus) {
        let old_status = {
            let mut status = self.status.lock();
            status.replace((new_status, Instant::now())).map(|(old, _)| old)
        };
        if old_status == Some(new_status) {
            return;
        }

        if !new_status.available && old_status.map_or(true, |old| old.available) {
            self.cache.lock().clear();
        }
        debug!("Big segment store status changed to {:?}", new_status);
        self.broadcaster.broadcast(new_status);
    }
}

impl Drop for BigSegmentStoreWrapper {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}
