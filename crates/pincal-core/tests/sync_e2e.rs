//! End-to-end sync tests
//!
//! Real tabs ([`TabBootstrapper`]) against real coordinators, with devices
//! linked through one in-process [`MemoryTransport`].
//!
//! ## What These Tests Verify
//!
//! - Tabs of one device share the same documents and see each other's edits
//! - Exactly one tab per calendar runs the WebRTC adapter
//! - A device joining through an invitation receives the shared document
//! - Closing the owner tab hands ownership to a remaining tab
//! - A tab dropped for missing heartbeats learns it and detaches

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use pincal_core::{
    CalendarApp, CalendarId, CoordinatorConfig, CoordinatorHost, Invitation, MemoryTransport,
    PeerConnectionId, RepoConfig, TabBootstrapper, TabConfig, TabEvent,
};

fn fast_coordinator() -> CoordinatorConfig {
    CoordinatorConfig {
        poll_interval: Duration::from_millis(50),
        poll_timeout: Duration::from_millis(500),
        heartbeat_interval: Duration::from_millis(200),
        max_missed_heartbeats: 3,
        repo: RepoConfig {
            find_timeout: Duration::from_secs(5),
        },
    }
}

fn tab(transport: &MemoryTransport) -> TabBootstrapper {
    TabBootstrapper::new(
        TabConfig {
            webrtc_grace_period: Duration::from_secs(2),
            repo: RepoConfig {
                find_timeout: Duration::from_secs(5),
            },
        },
        Arc::new(transport.clone()),
    )
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn load(
    host: &CoordinatorHost,
    transport: &MemoryTransport,
    calendar: CalendarId,
    app: Option<&CalendarApp>,
    invitation: Option<Invitation>,
) -> CalendarApp {
    let local = app.map(|a| a.doc_local().document_id());
    tokio::time::timeout(
        Duration::from_secs(10),
        tab(transport).load(host.connect(), calendar, None, local, invitation),
    )
    .await
    .expect("load timed out")
    .expect("load failed")
}

fn pins(app: &CalendarApp) -> Vec<String> {
    app.doc_shared()
        .read()
        .unwrap()
        .pin_catalog
        .pins
        .keys()
        .cloned()
        .collect()
}

fn add_pin(app: &CalendarApp, id: &str) {
    app.doc_shared()
        .mutate(|shared| {
            shared
                .pin_catalog
                .pins
                .insert(id.to_string(), json!({ "label": id }));
        })
        .unwrap();
}

#[tokio::test]
async fn test_tabs_of_one_device_share_documents() {
    let transport = MemoryTransport::new();
    let host = CoordinatorHost::new(fast_coordinator(), None);
    let calendar = CalendarId::new();

    let first = load(&host, &transport, calendar, None, None).await;
    let second = load(&host, &transport, calendar, Some(&first), None).await;

    assert_eq!(first.doc_shared().document_id(), second.doc_shared().document_id());
    assert_eq!(first.doc_local().document_id(), second.doc_local().document_id());
    assert_eq!(
        first.doc_ephemeral().document_id(),
        second.doc_ephemeral().document_id()
    );
    assert_eq!(
        [first.is_webrtc_owner(), second.is_webrtc_owner()]
            .iter()
            .filter(|owner| **owner)
            .count(),
        1
    );

    add_pin(&first, "swim");
    eventually("first edit to reach the second tab", || pins(&second) == ["swim"]).await;
    add_pin(&second, "yoga");
    eventually("second edit to reach the first tab", || pins(&first).len() == 2).await;
}

#[tokio::test]
async fn test_matching_invitation_in_second_tab_adds_peer() {
    let transport = MemoryTransport::new();
    let host = CoordinatorHost::new(fast_coordinator(), None);
    let calendar = CalendarId::new();

    let first = load(&host, &transport, calendar, None, None).await;
    let shared = first.doc_shared().document_id();
    let inviter = PeerConnectionId::from("phone");

    let second = load(
        &host,
        &transport,
        calendar,
        Some(&first),
        Some(Invitation::add_peer(shared, inviter.clone())),
    )
    .await;

    assert_eq!(second.doc_local().document_id_shared().unwrap(), Some(shared));
    eventually("inviting peer to be recorded", || {
        first
            .doc_local()
            .read()
            .unwrap()
            .remote_peers
            .contains_key(&inviter)
    })
    .await;
}

#[tokio::test]
async fn test_invited_device_receives_shared_document() {
    let transport = MemoryTransport::new();
    let calendar = CalendarId::new();

    let laptop_host = CoordinatorHost::new(fast_coordinator(), None);
    let laptop = load(&laptop_host, &transport, calendar, None, None).await;
    add_pin(&laptop, "garden");
    let invitation = laptop.invitation().unwrap();
    let laptop_id = laptop.doc_local().read().unwrap().local_peer.peer_connection_id;

    let phone_host = CoordinatorHost::new(fast_coordinator(), None);
    let phone = load(&phone_host, &transport, calendar, None, Some(invitation.clone())).await;

    assert_eq!(phone.doc_shared().document_id(), invitation.document_id);
    eventually("laptop content on the phone", || pins(&phone) == ["garden"]).await;
    eventually("phone to record the laptop", || {
        phone
            .doc_local()
            .read()
            .unwrap()
            .remote_peers
            .contains_key(&laptop_id)
    })
    .await;

    let phone_id = phone.doc_local().read().unwrap().local_peer.peer_connection_id;
    eventually("laptop to learn about the phone", || {
        laptop
            .doc_local()
            .read()
            .unwrap()
            .remote_peers
            .contains_key(&phone_id)
    })
    .await;
    eventually("presence of the phone on the laptop", || {
        laptop
            .doc_ephemeral()
            .read()
            .unwrap()
            .connected_peers
            .contains_key(&phone_id)
    })
    .await;

    add_pin(&phone, "run");
    eventually("phone edit to reach the laptop", || pins(&laptop).len() == 2).await;
}

#[tokio::test]
async fn test_closing_owner_hands_over_ownership() {
    let transport = MemoryTransport::new();
    let host = CoordinatorHost::new(fast_coordinator(), None);
    let calendar = CalendarId::new();

    let owner = load(&host, &transport, calendar, None, None).await;
    assert!(owner.is_webrtc_owner());
    let standby = load(&host, &transport, calendar, Some(&owner), None).await;
    assert!(!standby.is_webrtc_owner());
    let mut events = standby.subscribe_events();

    owner.close();
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no ownership change")
        .unwrap();
    assert_eq!(event, TabEvent::WebRtcStarted);
    assert!(standby.is_webrtc_owner());
}

#[tokio::test]
async fn test_silenced_owner_loses_ownership() {
    let transport = MemoryTransport::new();
    let host = CoordinatorHost::new(fast_coordinator(), None);
    let calendar = CalendarId::new();

    let owner = load(&host, &transport, calendar, None, None).await;
    let standby = load(&host, &transport, calendar, Some(&owner), None).await;
    let mut owner_events = owner.subscribe_events();

    owner.set_silenced(true);
    let event = tokio::time::timeout(Duration::from_secs(5), owner_events.recv())
        .await
        .expect("owner was never stopped")
        .unwrap();
    assert_eq!(event, TabEvent::WebRtcStopped);
    assert!(!owner.is_webrtc_owner());
    eventually("standby to take over", || standby.is_webrtc_owner()).await;
}

#[tokio::test]
async fn test_pruned_tab_observes_disconnect() {
    let transport = MemoryTransport::new();
    let host = CoordinatorHost::new(fast_coordinator(), None);
    let calendar = CalendarId::new();

    let owner = load(&host, &transport, calendar, None, None).await;
    let frozen = load(&host, &transport, calendar, Some(&owner), None).await;
    assert!(frozen.is_connected());
    let mut events = frozen.subscribe_events();

    frozen.set_silenced(true);
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("frozen tab never learned it was dropped")
        .unwrap();
    assert_eq!(event, TabEvent::Disconnected);
    assert!(!frozen.is_connected());
    assert!(frozen.repo_shared().network().adapters().is_empty());

    // The remaining tab keeps the session
    assert!(owner.is_connected());
    assert!(owner.is_webrtc_owner());
    let status = host
        .registry()
        .get(&calendar)
        .unwrap()
        .election_status()
        .await
        .unwrap();
    assert_eq!(status.tabs.len(), 1);
}
