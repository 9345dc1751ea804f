use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Broadcaster fans a value out to any number of subscribers.
///
/// Each subscriber gets its own unbounded channel, so a slow subscriber never causes another
/// to miss a value, and every subscriber sees values in the order they were broadcast.
/// Subscribers that dropped their receiver are pruned on the next broadcast.
pub struct Broadcaster<T> {
    subscribers: Mutex<Vec<UnboundedSender<T>>>,
}

impl<T: Clone> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn broadcast(&self, value: T) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(value.clone()).is_ok());
    }
}

impl<T: Clone> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}
