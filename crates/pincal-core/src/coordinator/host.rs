//! Connection endpoint tabs talk to
//!
//! Each call to [`CoordinatorHost::connect`] hands the tab a fresh port and
//! spawns a task that serves it: the first `init` binds the connection to a
//! calendar session, later messages are forwarded to that session's
//! election actor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{SessionRegistry, SharedRepo, TabId};
use crate::config::CoordinatorConfig;
use crate::messages::{CoordinatorConnection, FromSharedRepo, TabPort, ToSharedRepo};
use crate::port::message_channel;
use crate::repo::DocumentStorage;

/// Accepts tab connections for every calendar in the process
#[derive(Clone)]
pub struct CoordinatorHost {
    registry: Arc<SessionRegistry>,
    next_connection: Arc<AtomicU64>,
}

impl CoordinatorHost {
    pub fn new(config: CoordinatorConfig, storage: Option<DocumentStorage>) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(config, storage)),
            next_connection: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Open a connection; the tab wraps the returned end in a port channel
    pub fn connect(&self) -> CoordinatorConnection {
        let (tab_end, coordinator_end) = message_channel::<ToSharedRepo, FromSharedRepo>();
        let n = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let port = TabPort::new(format!("coordinator-{}", n), coordinator_end);

        let (tx, rx) = mpsc::unbounded_channel();
        port.subscribe(move |message: &ToSharedRepo| {
            let _ = tx.send(message.clone());
        });
        port.start();

        tokio::spawn(serve_connection(self.registry.clone(), port, rx));
        tab_end
    }
}

async fn serve_connection(
    registry: Arc<SessionRegistry>,
    port: TabPort,
    mut messages: mpsc::UnboundedReceiver<ToSharedRepo>,
) {
    let mut bound: Option<(Arc<SharedRepo>, TabId)> = None;

    while let Some(message) = messages.recv().await {
        let ToSharedRepo::Init(init) = message else {
            let Some((session, tab)) = &bound else {
                debug!(port = %port.name(), kind = message.kind(), "Message before init, ignoring");
                continue;
            };
            let result = match message {
                ToSharedRepo::WebRtcStartSuccess => session.webrtc_started(*tab),
                ToSharedRepo::WebRtcStopSuccess => session.webrtc_stopped(*tab),
                ToSharedRepo::WebRtcPollAliveAcq => session.heartbeat(*tab),
                ToSharedRepo::Init(_) => Ok(()),
            };
            if let Err(e) = result {
                error!(%tab, error = %e, "Failed to forward tab message");
            }
            continue;
        };

        if bound.is_some() {
            warn!(port = %port.name(), "Duplicate init on one connection, ignoring");
            continue;
        }

        let session = registry.get_or_create(init.calendar_id);
        match session.add_tab(&init, port.clone()).await {
            Ok(tab) => {
                info!(calendar = %init.calendar_id, %tab, "Tab connected");
                bound = Some((session, tab));
            }
            Err(e) => {
                error!(calendar = %init.calendar_id, error = %e, "Tab initialization failed");
                let _ = port.send(FromSharedRepo::InitFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    debug!(port = %port.name(), "Tab connection closed");
}
