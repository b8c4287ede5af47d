//! Tab-side bootstrapper
//!
//! A tab owns three memory-only repos that mirror the coordinator's stores
//! through message-channel adapters. Loading a calendar connects to the
//! coordinator, sends `init`, and resolves the three documents once the
//! coordinator reports `ready-local` and `ready-shared`.
//!
//! While loaded, the tab follows the coordinator's WebRTC commands: it
//! attaches a WebRTC adapter to its shared repo when elected and detaches
//! it when told to stop. A tab the coordinator drops for missing heartbeats
//! detaches from the session and reports [`TabEvent::Disconnected`].
//!
//! # Example
//!
//! ```ignore
//! use pincal_core::{CoordinatorHost, MemoryTransport, TabBootstrapper};
//!
//! let host = CoordinatorHost::new(Default::default(), None);
//! let tab = TabBootstrapper::new(Default::default(), Arc::new(MemoryTransport::new()));
//! let app = tab.load(host.connect(), calendar_id, None, None, None).await?;
//! app.doc_shared().mutate(|shared| shared.pin_catalog.removed.push("pin".into()))?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::TabConfig;
use crate::documents::{
    local_replica, shared_replica, EphemeralDocument, InvitationOutcome, LocalReplica,
    SharedReplica,
};
use crate::error::{PincalError, PincalResult};
use crate::invitation::Invitation;
use crate::messages::{
    CoordinatorConnection, CoordinatorPort, DocumentPorts, FromSharedRepo, InitMessage,
    ToSharedRepo,
};
use crate::port::{message_channel, ListenerId, PortSender, Transfer};
use crate::repo::{AdapterKind, MessageChannelAdapter, Replica, Repo};
use crate::types::{CalendarId, DocumentId};
use crate::webrtc::{PeerTransport, WebRtcAdapter, WebRtcAdapterOptions};

/// Default capacity for the tab event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Ownership transitions seen by one tab
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabEvent {
    /// This tab now runs the WebRTC adapter
    WebRtcStarted,
    /// This tab stopped running the WebRTC adapter
    WebRtcStopped,
    /// The coordinator dropped this tab; its documents no longer sync
    Disconnected,
}

/// Commands the coordinator sends that need the tab's documents
#[derive(Debug)]
enum Command {
    Start { available_locally: bool },
    Stop,
    Disconnect,
}

/// Documents the command task needs to start WebRTC
#[derive(Clone)]
struct WebRtcDocs {
    local: LocalReplica,
    ephemeral: Replica<EphemeralDocument>,
}

/// Loads calendars in one tab
pub struct TabBootstrapper {
    config: TabConfig,
    transport: Arc<dyn PeerTransport>,
}

impl TabBootstrapper {
    pub fn new(config: TabConfig, transport: Arc<dyn PeerTransport>) -> Self {
        Self { config, transport }
    }

    /// Connect to the coordinator and open the calendar's three documents
    ///
    /// `document_id_ephemeral` and `document_id_local` are the IDs this tab
    /// remembers from earlier sessions, if any.
    pub async fn load(
        &self,
        connection: CoordinatorConnection,
        calendar_id: CalendarId,
        document_id_ephemeral: Option<DocumentId>,
        document_id_local: Option<DocumentId>,
        invitation: Option<Invitation>,
    ) -> PincalResult<CalendarApp> {
        let repo_ephemeral = Repo::new("tab-ephemeral", self.config.repo.clone(), None);
        let repo_local = Repo::new("tab-local", self.config.repo.clone(), None);
        let repo_shared = Repo::new("tab-shared", self.config.repo.clone(), None);

        let (ephemeral_tab, ephemeral_coordinator) = message_channel();
        let (local_tab, local_coordinator) = message_channel();
        let (shared_tab, shared_coordinator) = message_channel();
        repo_ephemeral
            .network()
            .add_adapter(MessageChannelAdapter::new(ephemeral_tab));
        repo_local
            .network()
            .add_adapter(MessageChannelAdapter::new(local_tab));
        repo_shared
            .network()
            .add_adapter(MessageChannelAdapter::new(shared_tab));

        let port = CoordinatorPort::new(format!("tab-{}", calendar_id), connection);
        let silenced = Arc::new(AtomicBool::new(false));
        let connected = Arc::new(AtomicBool::new(true));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (docs_tx, docs_rx) = watch::channel(None);

        let listener = {
            let sender = port.sender();
            let silenced = silenced.clone();
            port.subscribe(move |message| match message {
                FromSharedRepo::WebRtcPollAlive => {
                    if silenced.load(Ordering::Relaxed) {
                        debug!("Silenced, not answering pollalive");
                        return;
                    }
                    let _ = sender.send(ToSharedRepo::WebRtcPollAliveAcq);
                }
                FromSharedRepo::WebRtcStart {
                    document_shared_available_locally_during_initialization,
                } => {
                    let _ = commands_tx.send(Command::Start {
                        available_locally: *document_shared_available_locally_during_initialization,
                    });
                }
                FromSharedRepo::WebRtcStop => {
                    let _ = commands_tx.send(Command::Stop);
                }
                FromSharedRepo::Disconnected => {
                    let _ = commands_tx.send(Command::Disconnect);
                }
                _ => {}
            })
        };

        let commands = tokio::spawn(run_commands(
            CommandContext {
                sender: port.sender(),
                repo_ephemeral: repo_ephemeral.clone(),
                repo_local: repo_local.clone(),
                repo_shared: repo_shared.clone(),
                connected: connected.clone(),
                transport: self.transport.clone(),
                config: self.config.clone(),
                events: events.clone(),
            },
            commands_rx,
            docs_rx,
        ));

        let ready_local = port.subscribe_once_async(|m| {
            matches!(
                m,
                FromSharedRepo::ReadyLocal { .. } | FromSharedRepo::InitFailed { .. }
            )
        });
        let ready_shared = port.subscribe_once_async(|m| {
            matches!(
                m,
                FromSharedRepo::ReadyShared | FromSharedRepo::InitFailed { .. }
            )
        });
        port.start();

        port.send(ToSharedRepo::Init(InitMessage {
            calendar_id,
            document_id_ephemeral,
            document_id_local,
            invitation: invitation.clone(),
            ports: Transfer::new(DocumentPorts {
                ephemeral: ephemeral_coordinator,
                local: local_coordinator,
                shared: shared_coordinator,
            }),
        }))?;

        let result = async {
            let (id_ephemeral, id_local) = match ready_local.await? {
                FromSharedRepo::ReadyLocal {
                    document_id_ephemeral,
                    document_id_local,
                } => (document_id_ephemeral, document_id_local),
                other => return Err(rejection(other)),
            };
            info!(calendar = %calendar_id, ephemeral = %id_ephemeral, local = %id_local, "Local documents ready");

            let doc_ephemeral: Replica<EphemeralDocument> =
                repo_ephemeral.find_replica(&id_ephemeral).await?;
            let doc_local = local_replica(repo_local.find(&id_local).await?);
            let local = doc_local.read()?;
            let _ = docs_tx.send(Some(WebRtcDocs {
                local: doc_local.clone(),
                ephemeral: doc_ephemeral.clone(),
            }));

            if let Some(invitation) = &invitation {
                process_invitation(&doc_local, invitation)?;
            }

            match ready_shared.await? {
                FromSharedRepo::ReadyShared => {}
                other => return Err(rejection(other)),
            }

            let id_shared = doc_local
                .document_id_shared()?
                .ok_or(PincalError::MissingDocument("shared document ID"))?;
            let doc_shared = shared_replica(repo_shared.find(&id_shared).await?);
            doc_shared.read()?;
            info!(calendar = %calendar_id, shared = %id_shared, "Shared document ready");

            let own_invitation =
                Invitation::add_peer(id_shared, local.local_peer.peer_connection_id.clone());
            info!(calendar = %calendar_id, invitation = %own_invitation, "Invitation link for this device");

            Ok::<_, PincalError>((doc_ephemeral, doc_local, doc_shared))
        }
        .await;

        match result {
            Ok((doc_ephemeral, doc_local, doc_shared)) => Ok(CalendarApp {
                calendar_id,
                port,
                listener,
                commands,
                silenced,
                connected,
                events,
                repo_ephemeral,
                repo_local,
                repo_shared,
                doc_ephemeral,
                doc_local,
                doc_shared,
            }),
            Err(e) => {
                error!(calendar = %calendar_id, error = %e, "Tab bootstrap failed");
                commands.abort();
                port.unsubscribe(listener);
                port.close();
                for repo in [&repo_ephemeral, &repo_local, &repo_shared] {
                    detach_all(repo);
                }
                Err(e)
            }
        }
    }
}

fn rejection(message: FromSharedRepo) -> PincalError {
    match message {
        FromSharedRepo::InitFailed { reason } => PincalError::Rejected(reason),
        other => PincalError::Rejected(format!("unexpected {} message", other)),
    }
}

/// Re-apply an invitation to the tab's replica of the local document
fn process_invitation(doc_local: &LocalReplica, invitation: &Invitation) -> PincalResult<()> {
    match doc_local.apply_invitation(invitation)? {
        InvitationOutcome::Conflict { stored, suggested } => {
            warn!(%stored, %suggested, "Invitation document ID differs from the stored one, ignoring");
        }
        outcome => {
            debug!(?outcome, peer = %invitation.peer_connection_id, "Invitation processed");
        }
    }
    Ok(())
}

fn detach_all(repo: &Repo) {
    let network = repo.network();
    for adapter in network.adapters() {
        network.remove_adapter(adapter.id);
    }
}

struct CommandContext {
    sender: PortSender<ToSharedRepo>,
    repo_ephemeral: Repo,
    repo_local: Repo,
    repo_shared: Repo,
    connected: Arc<AtomicBool>,
    transport: Arc<dyn PeerTransport>,
    config: TabConfig,
    events: broadcast::Sender<TabEvent>,
}

async fn run_commands(
    context: CommandContext,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut docs: watch::Receiver<Option<WebRtcDocs>>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Start { available_locally } => {
                let docs = match docs.wait_for(Option::is_some).await {
                    Ok(docs) => docs.clone(),
                    Err(_) => break,
                };
                let Some(docs) = docs else { continue };

                let wait_for_peer =
                    (!available_locally).then_some(context.config.webrtc_grace_period);
                info!(?wait_for_peer, "Starting WebRTC network adapter");
                let mut handle = context
                    .repo_shared
                    .network()
                    .add_adapter(WebRtcAdapter::new(WebRtcAdapterOptions {
                        transport: context.transport.clone(),
                        local: docs.local,
                        ephemeral: docs.ephemeral,
                        wait_for_peer,
                    }));
                if let Err(e) = handle.wait_ready().await {
                    error!(error = %e, "WebRTC network adapter failed to start");
                    context.repo_shared.network().remove_adapter(handle.id);
                    continue;
                }
                let _ = context.events.send(TabEvent::WebRtcStarted);
                if context.sender.send(ToSharedRepo::WebRtcStartSuccess).is_err() {
                    break;
                }
            }
            Command::Stop => {
                let removed = context
                    .repo_shared
                    .network()
                    .remove_adapters_of_kind(AdapterKind::WebRtc);
                info!(removed, "Stopped WebRTC network adapter");
                let _ = context.events.send(TabEvent::WebRtcStopped);
                if context.sender.send(ToSharedRepo::WebRtcStopSuccess).is_err() {
                    break;
                }
            }
            Command::Disconnect => break,
        }
    }
    // Either told so or the connection went away: this tab is out of the session
    disconnect(&context);
    debug!("Tab command loop stopped");
}

fn disconnect(context: &CommandContext) {
    context.connected.store(false, Ordering::Relaxed);
    let stopped = context
        .repo_shared
        .network()
        .remove_adapters_of_kind(AdapterKind::WebRtc);
    if stopped > 0 {
        let _ = context.events.send(TabEvent::WebRtcStopped);
    }
    for repo in [&context.repo_ephemeral, &context.repo_local, &context.repo_shared] {
        detach_all(repo);
    }
    warn!("Disconnected from the coordinator");
    let _ = context.events.send(TabEvent::Disconnected);
}

/// A loaded calendar in one tab
pub struct CalendarApp {
    calendar_id: CalendarId,
    port: CoordinatorPort,
    listener: ListenerId,
    commands: JoinHandle<()>,
    silenced: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<TabEvent>,
    repo_ephemeral: Repo,
    repo_local: Repo,
    repo_shared: Repo,
    doc_ephemeral: Replica<EphemeralDocument>,
    doc_local: LocalReplica,
    doc_shared: SharedReplica,
}

impl CalendarApp {
    pub fn calendar_id(&self) -> CalendarId {
        self.calendar_id
    }

    pub fn doc_ephemeral(&self) -> &Replica<EphemeralDocument> {
        &self.doc_ephemeral
    }

    pub fn doc_local(&self) -> &LocalReplica {
        &self.doc_local
    }

    pub fn doc_shared(&self) -> &SharedReplica {
        &self.doc_shared
    }

    pub fn repo_shared(&self) -> &Repo {
        &self.repo_shared
    }

    /// Whether this tab currently runs the WebRTC adapter
    pub fn is_webrtc_owner(&self) -> bool {
        self.repo_shared
            .network()
            .adapters()
            .iter()
            .any(|a| a.kind == AdapterKind::WebRtc)
    }

    /// Whether the coordinator still counts this tab as part of the session
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Invitation other devices can use to join this calendar
    pub fn invitation(&self) -> PincalResult<Invitation> {
        let local = self.doc_local.read()?;
        let shared = local
            .document_id_shared
            .ok_or(PincalError::MissingDocument("shared document ID"))?;
        Ok(Invitation::add_peer(shared, local.local_peer.peer_connection_id))
    }

    /// Stop answering liveness polls, as a frozen tab would
    pub fn set_silenced(&self, silenced: bool) {
        info!(calendar = %self.calendar_id, silenced, "Changing pollalive responses");
        self.silenced.store(silenced, Ordering::Relaxed);
    }

    /// Subscribe to ownership transitions of this tab
    pub fn subscribe_events(&self) -> broadcast::Receiver<TabEvent> {
        self.events.subscribe()
    }

    /// Leave the session: stop answering the coordinator and detach every
    /// adapter
    pub fn close(self) {
        info!(calendar = %self.calendar_id, "Closing tab");
        self.commands.abort();
        self.port.unsubscribe(self.listener);
        self.port.close();
        for repo in [&self.repo_ephemeral, &self.repo_local, &self.repo_shared] {
            detach_all(repo);
        }
    }
}
