//! Property-based tests for envelopes, invitations and replicas
//!
//! Uses proptest to check the invariants the coordinator relies on.

use std::collections::BTreeMap;

use proptest::prelude::*;
use serde::{Deserialize, Serialize};

use pincal_core::documents::{InvitationOutcome, LocalDocument};
use pincal_core::versioned::Resolved;
use pincal_core::{DocumentId, Invitation, PeerConnectionId, Repo, RepoConfig, Versioned};

// ============================================================================
// Strategy Generators
// ============================================================================

fn peer_id_strategy() -> impl Strategy<Value = PeerConnectionId> {
    "[a-z0-9-]{1,24}".prop_map(PeerConnectionId)
}

fn document_id_strategy() -> impl Strategy<Value = DocumentId> {
    any::<[u8; 16]>().prop_map(DocumentId)
}

fn invitation_strategy() -> impl Strategy<Value = Invitation> {
    (document_id_strategy(), peer_id_strategy())
        .prop_map(|(document, peer)| Invitation::add_peer(document, peer))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Pins {
    #[serde(default)]
    pins: BTreeMap<String, i64>,
}

#[derive(Debug, Clone)]
enum PinOp {
    Put(String, i64),
    Remove(String),
}

fn pin_ops_strategy() -> impl Strategy<Value = Vec<PinOp>> {
    let key = "[a-e]";
    prop::collection::vec(
        prop_oneof![
            3 => (key, any::<i64>()).prop_map(|(k, v)| PinOp::Put(k, v)),
            1 => key.prop_map(PinOp::Remove),
        ],
        0..30,
    )
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// A newer version than the reader's is always rejected, never read
    #[test]
    fn envelope_rejects_newer_versions(
        versions in prop::collection::btree_set(1u32..20, 1..5),
        current in 1u32..20,
    ) {
        let mut envelope = Versioned::default();
        for version in &versions {
            envelope.set(*version, &serde_json::json!({ "v": version })).unwrap();
        }
        let newest = *versions.iter().max().unwrap();

        let resolved: Resolved<serde_json::Value> = envelope.peek(current).unwrap();
        if newest > current {
            prop_assert_eq!(resolved, Resolved::Unsupported(newest));
        } else if versions.contains(&current) {
            prop_assert_eq!(resolved, Resolved::Current(serde_json::json!({ "v": current })));
        } else {
            prop_assert_eq!(resolved, Resolved::None);
        }
    }

    /// A wrapped value reads back as itself; the default is never used
    #[test]
    fn wrapped_value_resolves_to_itself(
        pins in prop::collection::btree_map("[a-e]{1,4}", any::<i64>(), 0..6),
        version in 1u32..20,
    ) {
        let value = Pins { pins };
        let mut envelope = Versioned::wrap(&value, version).unwrap();
        let resolved = envelope.resolve(version, Some(Pins::default)).unwrap();
        prop_assert_eq!(resolved, Resolved::Current(value));
        prop_assert_eq!(envelope.latest_version(), Some(version));
    }

    /// Non-numeric keys never count as versions
    #[test]
    fn envelope_ignores_non_numeric_keys(key in "[a-z]{1,8}", current in 1u32..5) {
        let mut envelope = Versioned::wrap(&serde_json::json!({}), current).unwrap();
        envelope.schema_version.insert(key, serde_json::json!(null));
        prop_assert_eq!(envelope.latest_version(), Some(current));
    }

    /// Applying the same invitation twice changes nothing the second time
    #[test]
    fn invitation_is_idempotent(invitation in invitation_strategy()) {
        let mut doc = LocalDocument::new_default();
        let first = doc.apply_invitation(&invitation);
        let after_first = doc.clone();
        let second = doc.apply_invitation(&invitation);

        prop_assert_eq!(first, InvitationOutcome::Adopted);
        prop_assert_eq!(second, InvitationOutcome::Matched);
        prop_assert_eq!(doc, after_first);
    }

    /// Once set, the shared ID and the local peer never change
    #[test]
    fn identity_is_stable(
        invitations in prop::collection::vec(invitation_strategy(), 1..8),
        extra_peers in prop::collection::vec(peer_id_strategy(), 0..8),
    ) {
        let mut doc = LocalDocument::new_default();
        let local_peer = doc.local_peer.clone();
        doc.apply_invitation(&invitations[0]);
        let stored = doc.document_id_shared;

        for invitation in &invitations[1..] {
            doc.apply_invitation(invitation);
        }
        for peer in extra_peers {
            doc.add_peer(peer, "");
        }

        prop_assert_eq!(doc.document_id_shared, stored);
        prop_assert_eq!(doc.local_peer, local_peer);
    }

    /// Every invitation link decodes back to the same invitation
    #[test]
    fn invitation_hash_roundtrip(invitation in invitation_strategy()) {
        let decoded = Invitation::decode(&invitation.encode()).unwrap();
        prop_assert_eq!(decoded, invitation);
    }

    /// A replica always reads back what its mutations produced
    #[test]
    fn replica_matches_model(ops in pin_ops_strategy()) {
        let repo = Repo::new("prop", RepoConfig::default(), None);
        let replica = repo.create_replica(&Pins::default()).unwrap();
        let mut model = Pins::default();

        for op in ops {
            match op {
                PinOp::Put(k, v) => {
                    model.pins.insert(k.clone(), v);
                    replica.mutate(|p| { p.pins.insert(k, v); }).unwrap();
                }
                PinOp::Remove(k) => {
                    model.pins.remove(&k);
                    replica.mutate(|p| { p.pins.remove(&k); }).unwrap();
                }
            }
        }
        prop_assert_eq!(replica.read().unwrap(), model);
    }
}
