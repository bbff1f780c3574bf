use std::sync::mpsc::{self, Receiver, Sender};

use parking_lot::Mutex;

/// Fan-out of status values to any number of subscribers.
///
/// Each subscriber gets its own unbounded channel, so sending never blocks on a slow receiver.
/// Subscribers whose receiver has been dropped are removed on the next broadcast.
pub struct Broadcaster<T> {
    subscribers: Mutex<Vec<Sender<T>>>,
}

impl<T: Clone> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber. It only receives values broadcast after this call.
    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Send `value` to every live subscriber.
    pub fn broadcast(&self, value: T) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(value.clone()).is_ok());
    }

    /// Number of registered subscribers, including any dropped since the last broadcast.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<T: Clone> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}
