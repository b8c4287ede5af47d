//! WebRTC ownership election
//!
//! One actor per session owns the tab list and the owner pointer. Nothing
//! else mutates them; tabs and the connection handlers talk to the actor
//! through its mailbox.
//!
//! ```text
//!   NO_OWNER ──elect──▶ OWNER(t) ──pollalive─▶ PROBING(t)
//!      ▲                   ▲                     │    │
//!      │                   └──────── acq ────────┘    │ timeout / closed
//!      └────────── webrtc-stop, mark t timed out ─────┘
//! ```
//!
//! A heartbeat sweep runs alongside the election and drops tabs that stop
//! answering altogether.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use rand::seq::IndexedRandom;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::{PincalError, PincalResult};
use crate::messages::{FromSharedRepo, TabPort, ToSharedRepo};
use crate::repo::{AdapterId, Repo};
use crate::types::{CalendarId, DocumentId};

/// Identifies a registered tab within one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TabId(u64);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tab-{}", self.0)
    }
}

/// Adapters a tab's ports were wired into, one per document store
#[derive(Debug, Clone, Copy)]
pub(crate) struct TabAdapters {
    pub ephemeral: AdapterId,
    pub local: AdapterId,
    pub shared: AdapterId,
}

/// Snapshot of one registered tab
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabStatus {
    pub id: TabId,
    pub timed_out: bool,
    pub missed_heartbeats: u32,
}

/// Snapshot of a session's election state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionStatus {
    pub tabs: Vec<TabStatus>,
    pub owner: Option<TabId>,
    pub webrtc_started: bool,
}

pub(crate) enum Command {
    Register {
        port: TabPort,
        adapters: TabAdapters,
        reply: oneshot::Sender<TabId>,
    },
    StartSucceeded {
        tab: TabId,
    },
    StopSucceeded {
        tab: TabId,
    },
    Heartbeat {
        tab: TabId,
    },
    Status {
        reply: oneshot::Sender<ElectionStatus>,
    },
}

/// Mailbox of a session's election actor
#[derive(Clone)]
pub(crate) struct ElectionHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ElectionHandle {
    /// A handle whose actor is already gone
    #[cfg(test)]
    pub(crate) fn stopped() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self { tx }
    }

    fn send(&self, command: Command) -> PincalResult<()> {
        self.tx
            .send(command)
            .map_err(|_| PincalError::ChannelClosed("election actor".to_string()))
    }

    pub(crate) async fn register(&self, port: TabPort, adapters: TabAdapters) -> PincalResult<TabId> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Register {
            port,
            adapters,
            reply,
        })?;
        rx.await
            .map_err(|_| PincalError::ChannelClosed("election actor".to_string()))
    }

    pub(crate) fn start_succeeded(&self, tab: TabId) -> PincalResult<()> {
        self.send(Command::StartSucceeded { tab })
    }

    pub(crate) fn stop_succeeded(&self, tab: TabId) -> PincalResult<()> {
        self.send(Command::StopSucceeded { tab })
    }

    pub(crate) fn heartbeat(&self, tab: TabId) -> PincalResult<()> {
        self.send(Command::Heartbeat { tab })
    }

    pub(crate) async fn status(&self) -> PincalResult<ElectionStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply })?;
        rx.await
            .map_err(|_| PincalError::ChannelClosed("election actor".to_string()))
    }
}

struct Tab {
    id: TabId,
    port: TabPort,
    adapters: TabAdapters,
    timed_out: bool,
    missed_heartbeats: u32,
}

/// Session state needed to answer tabs and detach dead ones
pub(crate) struct SessionContext {
    pub calendar_id: CalendarId,
    pub document_id_ephemeral: DocumentId,
    pub document_id_local: DocumentId,
    pub document_shared_available_locally: bool,
    pub repo_ephemeral: Repo,
    pub repo_local: Repo,
    pub repo_shared: Repo,
}

type Probe = Pin<Box<dyn Future<Output = bool> + Send>>;

pub(crate) struct ElectionActor {
    config: CoordinatorConfig,
    session: SessionContext,
    commands: mpsc::UnboundedReceiver<Command>,
    tabs: Vec<Tab>,
    owner: Option<TabId>,
    webrtc_started: bool,
    next_tab: u64,
}

impl ElectionActor {
    /// Spawn the actor; it runs until every handle is dropped
    pub(crate) fn spawn(config: CoordinatorConfig, session: SessionContext) -> ElectionHandle {
        let (tx, commands) = mpsc::unbounded_channel();
        let actor = Self {
            config,
            session,
            commands,
            tabs: Vec::new(),
            owner: None,
            webrtc_started: false,
            next_tab: 0,
        };
        tokio::spawn(actor.run());
        ElectionHandle { tx }
    }

    async fn run(mut self) {
        let calendar = self.session.calendar_id;
        info!(%calendar, "Election loop started");

        let mut probe: Option<Probe> = None;
        let poll = tokio::time::sleep_until(Instant::now());
        tokio::pin!(poll);

        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = &mut poll, if probe.is_none() => {
                    probe = self.poll_owner();
                    if probe.is_none() {
                        poll.as_mut().reset(Instant::now() + self.config.poll_interval);
                    }
                }
                alive = wait_probe(&mut probe), if probe.is_some() => {
                    probe = None;
                    self.on_probe_result(alive);
                    poll.as_mut().reset(Instant::now() + self.config.poll_interval);
                }
                _ = heartbeat.tick() => {
                    if self.sweep_heartbeats() {
                        // The owner was pruned; its probe no longer matters
                        probe = None;
                    }
                }
            }
        }
        info!(%calendar, "Election loop stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register {
                port,
                adapters,
                reply,
            } => {
                let id = TabId(self.next_tab);
                self.next_tab += 1;

                let ready_local = FromSharedRepo::ReadyLocal {
                    document_id_ephemeral: self.session.document_id_ephemeral,
                    document_id_local: self.session.document_id_local,
                };
                let _ = port.send(ready_local);
                if self.webrtc_started {
                    let _ = port.send(FromSharedRepo::ReadyShared);
                }

                info!(calendar = %self.session.calendar_id, tab = %id, tabs = self.tabs.len() + 1, "Tab registered");
                self.tabs.push(Tab {
                    id,
                    port,
                    adapters,
                    timed_out: false,
                    missed_heartbeats: 0,
                });
                let _ = reply.send(id);
            }
            Command::StartSucceeded { tab } => {
                self.touch(tab);
                if self.owner != Some(tab) {
                    debug!(%tab, "Start confirmation from a tab that is no longer the owner");
                }
                self.webrtc_started = true;
                info!(calendar = %self.session.calendar_id, %tab, "WebRTC started, shared document ready");
                for t in &self.tabs {
                    let _ = t.port.send(FromSharedRepo::ReadyShared);
                }
            }
            Command::StopSucceeded { tab } => {
                self.touch(tab);
                debug!(%tab, "WebRTC stopped");
            }
            Command::Heartbeat { tab } => self.touch(tab),
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn touch(&mut self, id: TabId) {
        if let Some(tab) = self.tabs.iter_mut().find(|t| t.id == id) {
            tab.missed_heartbeats = 0;
        }
    }

    /// Probe the owner if there is one; otherwise elect right away
    fn poll_owner(&mut self) -> Option<Probe> {
        let owner = self
            .owner
            .and_then(|id| self.tabs.iter().find(|t| t.id == id));
        let Some(owner) = owner else {
            self.owner = None;
            self.elect();
            return None;
        };

        let acq = owner
            .port
            .subscribe_once_async(|m| matches!(m, ToSharedRepo::WebRtcPollAliveAcq));
        let _ = owner.port.send(FromSharedRepo::WebRtcPollAlive);

        let timeout = self.config.poll_timeout;
        Some(Box::pin(async move {
            matches!(tokio::time::timeout(timeout, acq).await, Ok(Ok(_)))
        }))
    }

    fn on_probe_result(&mut self, alive: bool) {
        let Some(owner_id) = self.owner else {
            return;
        };
        if alive {
            return;
        }

        warn!(calendar = %self.session.calendar_id, tab = %owner_id, "WebRTC pollalive timed out");
        if let Some(owner) = self.tabs.iter_mut().find(|t| t.id == owner_id) {
            let _ = owner.port.send(FromSharedRepo::WebRtcStop);
            owner.timed_out = true;
        }
        self.owner = None;
        self.elect();
    }

    fn elect(&mut self) {
        if self.tabs.is_empty() {
            warn!(calendar = %self.session.calendar_id, "No tabs to host a WebRTC client in available");
            return;
        }

        if self.tabs.iter().all(|t| t.timed_out) {
            debug!("Every tab timed out, giving them another chance");
            for tab in &mut self.tabs {
                tab.timed_out = false;
            }
        }

        let candidates: Vec<usize> = (0..self.tabs.len())
            .filter(|&i| !self.tabs[i].timed_out)
            .collect();
        let Some(&index) = candidates.choose(&mut rand::rng()) else {
            return;
        };

        let tab = &self.tabs[index];
        self.owner = Some(tab.id);
        info!(calendar = %self.session.calendar_id, tab = %tab.id, "Elected WebRTC owner");
        let _ = tab.port.send(FromSharedRepo::WebRtcStart {
            document_shared_available_locally_during_initialization: self
                .session
                .document_shared_available_locally,
        });
    }

    /// Ping every tab and drop the ones that stopped answering. A dropped
    /// tab is told so and its connection closed.
    /// Returns whether the owner was dropped.
    fn sweep_heartbeats(&mut self) -> bool {
        let max_missed = self.config.max_missed_heartbeats;
        let (dead, alive): (Vec<Tab>, Vec<Tab>) = std::mem::take(&mut self.tabs)
            .into_iter()
            .partition(|t| t.missed_heartbeats >= max_missed || t.port.is_closed());
        self.tabs = alive;

        for tab in &mut self.tabs {
            tab.missed_heartbeats += 1;
            let _ = tab.port.send(FromSharedRepo::WebRtcPollAlive);
        }

        let mut owner_pruned = false;
        for tab in dead {
            warn!(calendar = %self.session.calendar_id, tab = %tab.id, "Pruning unresponsive tab");
            self.session
                .repo_ephemeral
                .network()
                .remove_adapter(tab.adapters.ephemeral);
            self.session.repo_local.network().remove_adapter(tab.adapters.local);
            self.session.repo_shared.network().remove_adapter(tab.adapters.shared);

            if self.owner == Some(tab.id) {
                let _ = tab.port.send(FromSharedRepo::WebRtcStop);
                self.owner = None;
                owner_pruned = true;
            }
            let _ = tab.port.send(FromSharedRepo::Disconnected);
            tab.port.close();
        }
        owner_pruned
    }

    fn status(&self) -> ElectionStatus {
        ElectionStatus {
            tabs: self
                .tabs
                .iter()
                .map(|t| TabStatus {
                    id: t.id,
                    timed_out: t.timed_out,
                    missed_heartbeats: t.missed_heartbeats,
                })
                .collect(),
            owner: self.owner,
            webrtc_started: self.webrtc_started,
        }
    }
}

async fn wait_probe(probe: &mut Option<Probe>) -> bool {
    match probe {
        Some(probe) => probe.await,
        None => std::future::pending().await,
    }
}
