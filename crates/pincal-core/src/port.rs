//! Typed message ports
//!
//! A port pair is the in-process stand-in for a browser `MessagePort`:
//! two unbounded queues crossed over. [`PortChannel`] wraps one end with
//! typed send, persistent listeners, and one-shot listeners that remove
//! themselves after their first match.
//!
//! Messages queue until [`PortChannel::start`] spawns the dispatcher, so
//! listeners registered before `start` never miss anything.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{PincalError, PincalResult};

/// One end of a raw port pair: sends `S`, receives `R`
pub struct RawPort<S, R> {
    pub(crate) tx: mpsc::UnboundedSender<S>,
    pub(crate) rx: mpsc::UnboundedReceiver<R>,
}

impl<S, R> fmt::Debug for RawPort<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawPort")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Create two entangled ports
pub fn message_channel<A, B>() -> (RawPort<A, B>, RawPort<B, A>) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        RawPort { tx: a_tx, rx: b_rx },
        RawPort { tx: b_tx, rx: a_rx },
    )
}

/// Port carrying sync frames for one document repo
pub type DocumentPort = RawPort<Bytes, Bytes>;

/// Single-use slot for moving a value through a cloneable message
///
/// The first `take` wins; later takes return `None`.
pub struct Transfer<T>(Arc<Mutex<Option<T>>>);

impl<T> Transfer<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(Mutex::new(Some(value))))
    }

    pub fn take(&self) -> Option<T> {
        self.0.lock().take()
    }
}

impl<T> Clone for Transfer<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> fmt::Debug for Transfer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.0.lock().is_some() { "pending" } else { "taken" };
        write!(f, "Transfer({})", state)
    }
}

/// Identifies a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

enum Listener<R> {
    Persistent(Box<dyn FnMut(&R) + Send>),
    /// Returns `true` once it has consumed a message and should be removed
    Once(Box<dyn FnMut(&R) -> bool + Send>),
}

struct Listeners<R> {
    next_id: u64,
    entries: Vec<(ListenerId, Listener<R>)>,
}

struct PortInner<S, R> {
    name: String,
    tx: mpsc::UnboundedSender<S>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<R>>>,
    listeners: Mutex<Listeners<R>>,
    closed: CancellationToken,
}

/// Sending half of a port, without access to listeners
pub struct PortSender<S> {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<S>,
}

impl<S> Clone for PortSender<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<S: fmt::Debug> PortSender<S> {
    /// Post a message; fails only if the other end is gone
    pub fn send(&self, message: S) -> PincalResult<()> {
        debug!(port = %self.name, ?message, "Posting message");
        self.tx
            .send(message)
            .map_err(|_| PincalError::ChannelClosed(self.name.to_string()))
    }
}

/// Typed wrapper around one end of a port pair
pub struct PortChannel<S, R> {
    inner: Arc<PortInner<S, R>>,
}

impl<S, R> Clone for PortChannel<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, R> fmt::Debug for PortChannel<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PortChannel").field(&self.inner.name).finish()
    }
}

impl<S, R> PortChannel<S, R>
where
    S: fmt::Debug + Send + 'static,
    R: fmt::Debug + Send + 'static,
{
    pub fn new(name: impl Into<String>, port: RawPort<S, R>) -> Self {
        Self {
            inner: Arc::new(PortInner {
                name: name.into(),
                tx: port.tx,
                rx: Mutex::new(Some(port.rx)),
                listeners: Mutex::new(Listeners {
                    next_id: 0,
                    entries: Vec::new(),
                }),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Post a message; fails only if the other end is gone
    pub fn send(&self, message: S) -> PincalResult<()> {
        debug!(port = %self.inner.name, ?message, "Posting message");
        self.inner
            .tx
            .send(message)
            .map_err(|_| PincalError::ChannelClosed(self.inner.name.clone()))
    }

    /// A send-only handle that does not keep the listeners alive
    pub fn sender(&self) -> PortSender<S> {
        PortSender {
            name: Arc::from(self.inner.name.as_str()),
            tx: self.inner.tx.clone(),
        }
    }

    /// Whether the other end has been dropped
    pub fn is_closed(&self) -> bool {
        self.inner.tx.is_closed()
    }

    /// Register a listener for every incoming message
    pub fn subscribe(&self, listener: impl FnMut(&R) + Send + 'static) -> ListenerId {
        self.register(Listener::Persistent(Box::new(listener)))
    }

    /// Register a listener that fires for the first message matching
    /// `predicate`, then removes itself
    pub fn subscribe_once(
        &self,
        predicate: impl Fn(&R) -> bool + Send + 'static,
        mut listener: impl FnMut(&R) + Send + 'static,
    ) -> ListenerId {
        self.register(Listener::Once(Box::new(move |message| {
            if predicate(message) {
                listener(message);
                true
            } else {
                false
            }
        })))
    }

    /// Resolve with the first message matching `predicate`
    ///
    /// The listener is registered when this is called, not when the future
    /// is first polled. The future fails if the port closes first.
    pub fn subscribe_once_async(
        &self,
        predicate: impl Fn(&R) -> bool + Send + 'static,
    ) -> impl Future<Output = PincalResult<R>> + Send + 'static
    where
        R: Clone,
    {
        let (tx, rx) = oneshot::channel();
        let mut slot = Some(tx);
        self.subscribe_once(predicate, move |message: &R| {
            if let Some(tx) = slot.take() {
                let _ = tx.send(message.clone());
            }
        });
        let name = self.inner.name.clone();
        async move { rx.await.map_err(|_| PincalError::ChannelClosed(name)) }
    }

    /// Remove a listener; returns whether it was still registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.entries.len();
        listeners.entries.retain(|(entry, _)| *entry != id);
        listeners.entries.len() != before
    }

    /// Begin dispatching incoming messages. Calling this twice is harmless.
    pub fn start(&self) {
        let Some(mut rx) = self.inner.rx.lock().take() else {
            trace!(port = %self.inner.name, "Port already started");
            return;
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = inner.closed.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                debug!(port = %inner.name, ?message, "Received message");
                inner.dispatch(&message);
            }
            debug!(port = %inner.name, "Port closed");
            // Dropping the listeners fails every pending one-shot future
            inner.listeners.lock().entries.clear();
        });
    }

    /// Stop receiving. The other end sees the port as closed once every
    /// clone of this channel is dropped.
    pub fn close(&self) {
        self.inner.closed.cancel();
        self.inner.rx.lock().take();
    }

    fn register(&self, listener: Listener<R>) -> ListenerId {
        let mut listeners = self.inner.listeners.lock();
        let id = ListenerId(listeners.next_id);
        listeners.next_id += 1;
        listeners.entries.push((id, listener));
        id
    }
}

impl<S, R> PortInner<S, R> {
    fn dispatch(&self, message: &R) {
        // Run listeners outside the lock so they may register or remove others
        let mut current = std::mem::take(&mut self.listeners.lock().entries);
        current.retain_mut(|(_, listener)| match listener {
            Listener::Persistent(f) => {
                f(message);
                true
            }
            Listener::Once(f) => !f(message),
        });

        let mut listeners = self.listeners.lock();
        let added = std::mem::take(&mut listeners.entries);
        current.extend(added);
        listeners.entries = current;
    }
}
