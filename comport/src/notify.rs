//! Notifications raised by the event monitor and the subscribers receiving them.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};

use crate::status::{LineError, ModemPin};

/// Something that happened on an open port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Bytes arrived.
    DataReceived(Vec<u8>),
    /// A line error was detected.
    ErrorOccurred(LineError),
    /// A modem pin changed; `state` is its level after the change.
    PinChanged {
        /// The pin that changed.
        pin: ModemPin,
        /// Current level.
        state: bool,
    },
    /// A break condition was detected.
    BreakDetected,
    /// The last byte of the output queue was sent.
    TransmitQueueEmpty,
    /// The port was lost and the monitor stopped.
    Disconnected {
        /// Why the port was lost.
        reason: String,
    },
}

type DataHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(LineError) + Send + Sync>;
type PinHandler = Arc<dyn Fn(ModemPin, bool) + Send + Sync>;
type EventHandler = Arc<dyn Fn() + Send + Sync>;
type DisconnectHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default, Clone)]
struct Lists {
    data: Vec<DataHandler>,
    error: Vec<ErrorHandler>,
    pin: Vec<PinHandler>,
    brk: Vec<EventHandler>,
    tx_empty: Vec<EventHandler>,
    disconnected: Vec<DisconnectHandler>,
    channels: Vec<(u64, Sender<Notification>)>,
    next_channel: u64,
}

/// Registered consumers of notifications.
///
/// Dispatch works on a snapshot of the lists, so handlers may register
/// further handlers or disconnect the port while being called.
#[derive(Default)]
pub struct Subscribers {
    lists: Mutex<Lists>,
}

impl Subscribers {
    fn edit<R>(&self, f: impl FnOnce(&mut Lists) -> R) -> R {
        let mut lists = self
            .lists
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut lists)
    }

    fn snapshot(&self) -> Lists {
        self.edit(|lists| lists.clone())
    }

    /// Register a handler for received data.
    pub fn on_data_received(&self, handler: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.edit(|lists| {
            lists
                .data
                .push(Arc::new(handler));
        });
    }

    /// Register a handler for line errors.
    pub fn on_error(&self, handler: impl Fn(LineError) + Send + Sync + 'static) {
        self.edit(|lists| {
            lists
                .error
                .push(Arc::new(handler));
        });
    }

    /// Register a handler for modem pin changes.
    pub fn on_pin_changed(&self, handler: impl Fn(ModemPin, bool) + Send + Sync + 'static) {
        self.edit(|lists| {
            lists
                .pin
                .push(Arc::new(handler));
        });
    }

    /// Register a handler for break conditions.
    pub fn on_break(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.edit(|lists| {
            lists
                .brk
                .push(Arc::new(handler));
        });
    }

    /// Register a handler for an emptied output queue.
    pub fn on_transmit_empty(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.edit(|lists| {
            lists
                .tx_empty
                .push(Arc::new(handler));
        });
    }

    /// Register a handler for a lost port.
    pub fn on_disconnected(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.edit(|lists| {
            lists
                .disconnected
                .push(Arc::new(handler));
        });
    }

    /// Open a channel receiving every notification.
    ///
    /// The channel is dropped from the list once its receiver is gone.
    pub fn subscribe(&self) -> Receiver<Notification> {
        let (tx, rx) = mpsc::channel();
        self.edit(|lists| {
            let id = lists.next_channel;
            lists.next_channel += 1;
            lists
                .channels
                .push((id, tx));
        });
        rx
    }

    /// Whether anybody consumes received data.
    pub fn has_data_consumer(&self) -> bool {
        self.edit(|lists| !lists.data.is_empty() || !lists.channels.is_empty())
    }

    /// Deliver `notification` to every matching subscriber.
    pub fn dispatch(&self, notification: &Notification) {
        let lists = self.snapshot();
        match notification {
            Notification::DataReceived(data) => lists
                .data
                .iter()
                .for_each(|h| h(data)),
            Notification::ErrorOccurred(error) => lists
                .error
                .iter()
                .for_each(|h| h(*error)),
            Notification::PinChanged { pin, state } => lists
                .pin
                .iter()
                .for_each(|h| h(*pin, *state)),
            Notification::BreakDetected => lists
                .brk
                .iter()
                .for_each(|h| h()),
            Notification::TransmitQueueEmpty => lists
                .tx_empty
                .iter()
                .for_each(|h| h()),
            Notification::Disconnected { reason } => lists
                .disconnected
                .iter()
                .for_each(|h| h(reason)),
        }

        let dead: Vec<u64> = lists
            .channels
            .iter()
            .filter(|(_, tx)| {
                tx.send(notification.clone())
                    .is_err()
            })
            .map(|(id, _)| *id)
            .collect();
        if !dead.is_empty() {
            self.edit(|lists| {
                lists
                    .channels
                    .retain(|(id, _)| !dead.contains(id));
            });
        }
    }
}
