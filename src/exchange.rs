//! Single-scalar rendezvous between two process groups.
//!
//! The publisher hands one value to the subscriber and then waits for the
//! subscriber's acknowledgement, so neither side can run ahead to the next
//! coupling point with a stale value.

use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("peer group disconnected")]
    Disconnected,
}

#[derive(Debug)]
pub struct ScalarPublisher {
    value_tx: mpsc::Sender<f64>,
    ack_rx: mpsc::Receiver<()>,
}

#[derive(Debug)]
pub struct ScalarSubscriber {
    value_rx: mpsc::Receiver<f64>,
    ack_tx: mpsc::Sender<()>,
}

/// Creates a connected publisher/subscriber pair.
///
/// Both ends block the calling thread; call them from blocking tasks,
/// never from inside an async context.
pub fn scalar_link() -> (ScalarPublisher, ScalarSubscriber) {
    let (value_tx, value_rx) = mpsc::channel(1);
    let (ack_tx, ack_rx) = mpsc::channel(1);
    (ScalarPublisher { value_tx, ack_rx }, ScalarSubscriber { value_rx, ack_tx })
}

impl ScalarPublisher {
    /// Sends `value` and waits until the subscriber has taken it.
    pub fn publish(&mut self, value: f64) -> Result<(), ExchangeError> {
        self.value_tx.blocking_send(value).map_err(|_| ExchangeError::Disconnected)?;
        self.ack_rx.blocking_recv().ok_or(ExchangeError::Disconnected)
    }
}

impl ScalarSubscriber {
    /// Waits for the next value and releases the publisher.
    pub fn receive(&mut self) -> Result<f64, ExchangeError> {
        let value = self.value_rx.blocking_recv().ok_or(ExchangeError::Disconnected)?;
        self.ack_tx.blocking_send(()).map_err(|_| ExchangeError::Disconnected)?;
        Ok(value)
    }
}

/// Which side of the link a harness holds.
#[derive(Debug)]
pub enum LinkEnd {
    Publisher(ScalarPublisher),
    Subscriber(ScalarSubscriber),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_values_arrive_in_order() {
        let (mut publisher, mut subscriber) = scalar_link();
        let consumer = thread::spawn(move || (0..5).map(|_| subscriber.receive().unwrap()).collect::<Vec<_>>());

        for i in 0..5 {
            publisher.publish(300.0 + f64::from(i)).unwrap();
        }
        assert_eq!(consumer.join().unwrap(), vec![300.0, 301.0, 302.0, 303.0, 304.0]);
    }

    #[test]
    fn test_dropped_subscriber_disconnects() {
        let (mut publisher, subscriber) = scalar_link();
        drop(subscriber);
        assert_eq!(publisher.publish(1.0), Err(ExchangeError::Disconnected));
    }

    #[test]
    fn test_dropped_publisher_disconnects() {
        let (publisher, mut subscriber) = scalar_link();
        drop(publisher);
        assert_eq!(subscriber.receive(), Err(ExchangeError::Disconnected));
    }
}
