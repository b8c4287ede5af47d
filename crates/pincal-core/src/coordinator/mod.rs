//! Per-session coordinator
//!
//! One [`SharedRepo`] exists per calendar. It owns the three document stores
//! the calendar's tabs sync through, runs one-time initialization on the
//! first `init`, wires every tab's ports into those stores, and hosts the
//! WebRTC ownership election for the session.
//!
//! ```text
//!            ┌──────────────────── SharedRepo ─────────────────────┐
//!  tab A ═══▶│ repo_ephemeral (memory)                              │
//!  tab B ═══▶│ repo_local     (redb)     ElectionActor ──▶ tabs     │
//!  tab C ═══▶│ repo_shared    (redb)                                │
//!            └──────────────────────────────────────────────────────┘
//! ```

mod election;
mod host;
mod registry;

pub use election::{ElectionStatus, TabId, TabStatus};
pub use host::CoordinatorHost;
pub use registry::SessionRegistry;

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::config::CoordinatorConfig;
use crate::documents::{
    local_replica, EphemeralDocument, InvitationOutcome, LocalDocument, LocalReplica,
    SharedDocument, LOCAL_DOCUMENT_SCHEMA_VERSION_CURRENT, SHARED_DOCUMENT_SCHEMA_VERSION_CURRENT,
};
use crate::error::{PincalError, PincalResult};
use crate::messages::{DocumentPorts, InitMessage, TabPort};
use crate::repo::{DocumentStorage, MessageChannelAdapter, Replica, Repo};
use crate::types::CalendarId;
use crate::versioned::Versioned;
use election::{ElectionActor, ElectionHandle, SessionContext, TabAdapters};

/// Outcome of a session's one-time initialization
#[derive(Clone)]
pub struct Initialized {
    pub doc_ephemeral: Replica<EphemeralDocument>,
    pub doc_local: LocalReplica,
    pub document_shared_available_locally: bool,
    election: ElectionHandle,
}

/// Coordinator for one calendar session
pub struct SharedRepo {
    calendar_id: CalendarId,
    config: CoordinatorConfig,
    repo_ephemeral: Repo,
    repo_local: Repo,
    repo_shared: Repo,
    initialized: OnceCell<Result<Initialized, Arc<PincalError>>>,
}

impl SharedRepo {
    /// Create a coordinator; `storage` backs the local and shared repos
    pub fn new(
        calendar_id: CalendarId,
        config: CoordinatorConfig,
        storage: Option<DocumentStorage>,
    ) -> Self {
        Self {
            calendar_id,
            repo_ephemeral: Repo::new("repo-ephemeral", config.repo.clone(), None),
            repo_local: Repo::new("repo-local", config.repo.clone(), storage.clone()),
            repo_shared: Repo::new("repo-shared", config.repo.clone(), storage),
            config,
            initialized: OnceCell::new(),
        }
    }

    pub fn calendar_id(&self) -> CalendarId {
        self.calendar_id
    }

    pub fn repo_ephemeral(&self) -> &Repo {
        &self.repo_ephemeral
    }

    pub fn repo_local(&self) -> &Repo {
        &self.repo_local
    }

    pub fn repo_shared(&self) -> &Repo {
        &self.repo_shared
    }

    /// Run initialization once; every caller sees the same outcome
    pub async fn initialize(&self, message: &InitMessage) -> PincalResult<&Initialized> {
        let outcome = self
            .initialized
            .get_or_init(|| async { self.initialize_inner(message).await.map_err(Arc::new) })
            .await;
        match outcome {
            Ok(initialized) => Ok(initialized),
            Err(e) => Err(PincalError::Initialization(e.clone())),
        }
    }

    /// The initialization outcome, if initialization has finished successfully
    pub fn initialized(&self) -> Option<&Initialized> {
        self.initialized.get().and_then(|outcome| outcome.as_ref().ok())
    }

    async fn initialize_inner(&self, message: &InitMessage) -> PincalResult<Initialized> {
        let calendar = self.calendar_id;

        let doc_ephemeral = self
            .repo_ephemeral
            .create_replica(&EphemeralDocument::default())?;

        let doc_local = match message.document_id_local {
            Some(id) => local_replica(self.repo_local.find(&id).await?),
            None => {
                let envelope = Versioned::wrap(
                    &LocalDocument::new_default(),
                    LOCAL_DOCUMENT_SCHEMA_VERSION_CURRENT,
                )?;
                local_replica(self.repo_local.create(&envelope)?)
            }
        };
        // Fails on unsupported versions and inserts version 1 content if absent
        let local = doc_local.read()?;
        info!(
            %calendar,
            ephemeral = %doc_ephemeral.document_id(),
            local = %doc_local.document_id(),
            peer = %local.local_peer.peer_connection_id,
            "Resolved ephemeral and local documents"
        );

        if let Some(invitation) = &message.invitation {
            if let InvitationOutcome::Conflict { stored, suggested } =
                doc_local.apply_invitation(invitation)?
            {
                warn!(%calendar, %stored, %suggested, "Invitation names a different shared document");
            }
        }

        // No adapter is attached yet, so this cannot wait on the network
        let document_shared_available_locally = match doc_local.document_id_shared()? {
            Some(id) => match self.repo_shared.find_local(&id) {
                Ok(_) => true,
                Err(PincalError::DocumentNotFound(_)) => {
                    info!(%calendar, shared = %id, "Shared document not available locally yet");
                    false
                }
                Err(e) => return Err(e),
            },
            None => {
                let envelope = Versioned::wrap(
                    &SharedDocument::default(),
                    SHARED_DOCUMENT_SCHEMA_VERSION_CURRENT,
                )?;
                let handle = self.repo_shared.create(&envelope)?;
                let id = handle.document_id();
                doc_local.mutate(|local| local.document_id_shared = Some(id))?;
                info!(%calendar, shared = %id, "No shared document ID was set, created a new document");
                true
            }
        };

        let election = ElectionActor::spawn(
            self.config.clone(),
            SessionContext {
                calendar_id: calendar,
                document_id_ephemeral: doc_ephemeral.document_id(),
                document_id_local: doc_local.document_id(),
                document_shared_available_locally,
                repo_ephemeral: self.repo_ephemeral.clone(),
                repo_local: self.repo_local.clone(),
                repo_shared: self.repo_shared.clone(),
            },
        );

        Ok(Initialized {
            doc_ephemeral,
            doc_local,
            document_shared_available_locally,
            election,
        })
    }

    /// Initialize if needed, then wire the tab's ports and register it
    ///
    /// The election actor answers the tab with `ready-local` (and
    /// `ready-shared` if WebRTC already started).
    pub async fn add_tab(&self, message: &InitMessage, port: TabPort) -> PincalResult<TabId> {
        let initialized = self.initialize(message).await?;

        let ports = message
            .ports
            .take()
            .ok_or_else(|| PincalError::ChannelClosed("document ports already taken".to_string()))?;
        self.register_tab(&initialized.election, ports, port).await
    }

    /// Wire a tab's document ports into the stores and enter it in the
    /// election; the ports are detached again if it cannot be entered
    async fn register_tab(
        &self,
        election: &ElectionHandle,
        ports: DocumentPorts,
        port: TabPort,
    ) -> PincalResult<TabId> {
        let adapters = TabAdapters {
            ephemeral: self
                .repo_ephemeral
                .network()
                .add_adapter(MessageChannelAdapter::new(ports.ephemeral))
                .id,
            local: self
                .repo_local
                .network()
                .add_adapter(MessageChannelAdapter::new(ports.local))
                .id,
            shared: self
                .repo_shared
                .network()
                .add_adapter(MessageChannelAdapter::new(ports.shared))
                .id,
        };

        let registered = election.register(port, adapters).await;
        if let Err(e) = &registered {
            warn!(calendar = %self.calendar_id, error = %e, "Tab registration failed, detaching its ports");
            self.repo_ephemeral.network().remove_adapter(adapters.ephemeral);
            self.repo_local.network().remove_adapter(adapters.local);
            self.repo_shared.network().remove_adapter(adapters.shared);
        }
        registered
    }

    pub(crate) fn webrtc_started(&self, tab: TabId) -> PincalResult<()> {
        self.election()?.start_succeeded(tab)
    }

    pub(crate) fn webrtc_stopped(&self, tab: TabId) -> PincalResult<()> {
        self.election()?.stop_succeeded(tab)
    }

    pub(crate) fn heartbeat(&self, tab: TabId) -> PincalResult<()> {
        self.election()?.heartbeat(tab)
    }

    /// Snapshot of the election state
    pub async fn election_status(&self) -> PincalResult<ElectionStatus> {
        self.election()?.status().await
    }

    fn election(&self) -> PincalResult<&ElectionHandle> {
        self.initialized()
            .map(|i| &i.election)
            .ok_or_else(|| PincalError::MissingDocument("initialized session"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::port::{message_channel, DocumentPort, Transfer};
    use crate::types::DocumentId;

    fn init_message(
        calendar_id: CalendarId,
        document_id_local: Option<DocumentId>,
    ) -> (InitMessage, Vec<DocumentPort>) {
        let (ephemeral, ephemeral_coordinator) = message_channel();
        let (local, local_coordinator) = message_channel();
        let (shared, shared_coordinator) = message_channel();
        let message = InitMessage {
            calendar_id,
            document_id_ephemeral: None,
            document_id_local,
            invitation: None,
            ports: Transfer::new(DocumentPorts {
                ephemeral: ephemeral_coordinator,
                local: local_coordinator,
                shared: shared_coordinator,
            }),
        };
        (message, vec![ephemeral, local, shared])
    }

    #[tokio::test]
    async fn test_concurrent_initialization_runs_once() {
        let session = SharedRepo::new(CalendarId::new(), CoordinatorConfig::default(), None);
        let messages: Vec<_> = (0..4)
            .map(|_| init_message(session.calendar_id(), None))
            .collect();

        let outcomes =
            futures::future::join_all(messages.iter().map(|(m, _)| session.initialize(m))).await;
        let locals: HashSet<_> = outcomes
            .into_iter()
            .map(|outcome| outcome.unwrap().doc_local.document_id())
            .collect();

        assert_eq!(locals.len(), 1);
        assert_eq!(session.repo_local().document_ids().len(), 1);
        assert_eq!(session.repo_shared().document_ids().len(), 1);
        assert_eq!(session.repo_ephemeral().document_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_initialization_is_shared() {
        let session = SharedRepo::new(CalendarId::new(), CoordinatorConfig::default(), None);
        let (missing, _missing_ports) = init_message(session.calendar_id(), Some(DocumentId::new()));
        let (fresh, _fresh_ports) = init_message(session.calendar_id(), None);

        let first = session.initialize(&missing).await;
        assert!(matches!(first, Err(PincalError::Initialization(_))));

        // A later init with no local ID still sees the first failure
        let second = session.initialize(&fresh).await;
        assert!(matches!(
            second,
            Err(PincalError::Initialization(inner)) if matches!(*inner, PincalError::DocumentNotFound(_))
        ));
        assert!(session.initialized().is_none());
        assert!(session.election_status().await.is_err());
    }

    #[tokio::test]
    async fn test_failed_registration_detaches_ports() {
        let session = SharedRepo::new(CalendarId::new(), CoordinatorConfig::default(), None);
        let (message, _tab_ports) = init_message(session.calendar_id(), None);
        let ports = message.ports.take().unwrap();
        let (_tab_end, coordinator_end) = message_channel();
        let port = TabPort::new("coordinator-test", coordinator_end);

        let result = session
            .register_tab(&ElectionHandle::stopped(), ports, port)
            .await;

        assert!(matches!(result, Err(PincalError::ChannelClosed(_))));
        for repo in [session.repo_ephemeral(), session.repo_local(), session.repo_shared()] {
            assert!(repo.network().adapters().is_empty());
        }
    }
}
