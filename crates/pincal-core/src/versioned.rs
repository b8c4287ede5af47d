//! Versioned document envelope
//!
//! Persistent documents wrap their payload as
//! `{ "schemaVersion": { "<n>": payload } }` so a reader can tell whether it
//! understands what it loaded. Resolution against the reader's current
//! version `c` works as follows:
//!
//! - some integer key is greater than `c`: [`Resolved::Unsupported`]
//! - key `c` is present: [`Resolved::Current`]
//! - a default factory exists: the default is inserted under `c` and
//!   returned as [`Resolved::Current`]
//! - otherwise: [`Resolved::None`]
//!
//! Keys that are not integers are ignored. Older versions are left in place;
//! there is no migration between versions.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::error::{PincalError, PincalResult};
use crate::repo::{DocHandle, Replica};
use crate::types::DocumentId;

/// Outcome of resolving an envelope against the reader's current version
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved<T> {
    Current(T),
    /// The envelope holds a newer version than the reader supports
    Unsupported(u32),
    None,
}

/// Envelope mapping schema versions to payloads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Versioned {
    #[serde(default)]
    pub schema_version: BTreeMap<String, Value>,
}

impl Versioned {
    /// Wrap `value` as the only version in a new envelope
    pub fn wrap<T: Serialize>(value: &T, version: u32) -> PincalResult<Self> {
        let mut envelope = Self::default();
        envelope.set(version, value)?;
        Ok(envelope)
    }

    /// Highest integer version key, if any
    pub fn latest_version(&self) -> Option<u32> {
        self.schema_version
            .keys()
            .filter_map(|key| key.parse::<u32>().ok())
            .max()
    }

    /// Store `value` under `version`, replacing what was there
    pub fn set<T: Serialize>(&mut self, version: u32, value: &T) -> PincalResult<()> {
        self.schema_version
            .insert(version.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Resolve without inserting a default
    pub fn peek<T: DeserializeOwned>(&self, current: u32) -> PincalResult<Resolved<T>> {
        if let Some(latest) = self.latest_version() {
            if latest > current {
                return Ok(Resolved::Unsupported(latest));
            }
        }
        match self.schema_version.get(&current.to_string()) {
            Some(value) => Ok(Resolved::Current(serde_json::from_value(value.clone())?)),
            None => Ok(Resolved::None),
        }
    }

    /// Resolve, inserting the default under `current` when it is missing
    pub fn resolve<T: Serialize + DeserializeOwned>(
        &mut self,
        current: u32,
        default: Option<fn() -> T>,
    ) -> PincalResult<Resolved<T>> {
        match (self.peek(current)?, default) {
            (Resolved::None, Some(make)) => {
                let value = make();
                self.set(current, &value)?;
                Ok(Resolved::Current(value))
            }
            (resolved, _) => Ok(resolved),
        }
    }
}

/// Typed replica of a versioned document
///
/// Reads and writes go through the payload stored under the reader's
/// current version.
pub struct VersionedReplica<T> {
    replica: Replica<Versioned>,
    version: u32,
    kind: &'static str,
    default: Option<fn() -> T>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for VersionedReplica<T> {
    fn clone(&self) -> Self {
        Self {
            replica: self.replica.clone(),
            version: self.version,
            kind: self.kind,
            default: self.default,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for VersionedReplica<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedReplica")
            .field("kind", &self.kind)
            .field("version", &self.version)
            .field("document", &self.replica.document_id())
            .finish()
    }
}

impl<T: Serialize + DeserializeOwned> VersionedReplica<T> {
    pub fn new(
        handle: DocHandle,
        kind: &'static str,
        version: u32,
        default: Option<fn() -> T>,
    ) -> Self {
        Self {
            replica: Replica::new(handle),
            version,
            kind,
            default,
            _marker: PhantomData,
        }
    }

    pub fn document_id(&self) -> DocumentId {
        self.replica.document_id()
    }

    pub fn handle(&self) -> &DocHandle {
        self.replica.handle()
    }

    pub fn envelope(&self) -> PincalResult<Versioned> {
        self.replica.read()
    }

    /// Resolve the current version, inserting the default as a tracked
    /// change when it is missing
    pub fn resolve(&self) -> PincalResult<Resolved<T>> {
        let resolved = self.envelope()?.peek(self.version)?;
        match (resolved, self.default) {
            (Resolved::None, Some(default)) => {
                let version = self.version;
                self.replica
                    .mutate(|envelope| envelope.resolve(version, Some(default)))?
            }
            (resolved, _) => Ok(resolved),
        }
    }

    /// Read the current payload; unsupported or missing versions are errors
    pub fn read(&self) -> PincalResult<T> {
        match self.resolve()? {
            Resolved::Current(value) => Ok(value),
            Resolved::Unsupported(version) => Err(PincalError::UnsupportedSchemaVersion {
                kind: self.kind,
                version,
            }),
            Resolved::None => Err(PincalError::MissingDocument(self.kind)),
        }
    }

    /// Edit the current payload as one tracked change
    pub fn mutate<R>(&self, f: impl FnOnce(&mut T) -> R) -> PincalResult<R> {
        let version = self.version;
        let default = self.default;
        let kind = self.kind;
        self.replica.mutate(|envelope| {
            let mut value = match envelope.resolve(version, default)? {
                Resolved::Current(value) => value,
                Resolved::Unsupported(found) => {
                    return Err(PincalError::UnsupportedSchemaVersion {
                        kind,
                        version: found,
                    })
                }
                Resolved::None => return Err(PincalError::MissingDocument(kind)),
            };
            let result = f(&mut value);
            envelope.set(version, &value)?;
            Ok(result)
        })?
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.replica.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepoConfig;
    use crate::repo::Repo;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
    }

    fn make_default() -> Payload {
        Payload {
            name: "default".to_string(),
        }
    }

    fn envelope(value: Value) -> Versioned {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_current_version_found() {
        let mut env = envelope(json!({ "schemaVersion": { "1": { "name": "a" } } }));
        let resolved = env.resolve(1, Some(make_default)).unwrap();
        assert_eq!(resolved, Resolved::Current(Payload { name: "a".into() }));
    }

    #[test]
    fn test_newer_version_is_unsupported() {
        let mut env = envelope(json!({ "schemaVersion": { "1": { "name": "a" }, "2": {} } }));
        let resolved = env.resolve(1, Some(make_default)).unwrap();
        assert_eq!(resolved, Resolved::Unsupported(2));
        assert_eq!(env.schema_version.len(), 2);
    }

    #[test]
    fn test_missing_version_uses_default() {
        let mut env = Versioned::default();
        let resolved = env.resolve(1, Some(make_default)).unwrap();
        assert_eq!(resolved, Resolved::Current(make_default()));
        assert!(env.schema_version.contains_key("1"));
    }

    #[test]
    fn test_missing_version_without_default() {
        let mut env = Versioned::default();
        assert_eq!(env.resolve::<Payload>(1, None).unwrap(), Resolved::None);
        assert!(env.schema_version.is_empty());
    }

    #[test]
    fn test_older_version_only_gets_default_alongside() {
        let mut env = envelope(json!({ "schemaVersion": { "0": { "legacy": true } } }));
        let resolved = env.resolve(1, Some(make_default)).unwrap();
        assert_eq!(resolved, Resolved::Current(make_default()));
        assert!(env.schema_version.contains_key("0"));
    }

    #[test]
    fn test_non_numeric_keys_ignored() {
        let env = envelope(json!({ "schemaVersion": { "draft": {}, "1": { "name": "x" } } }));
        assert_eq!(env.latest_version(), Some(1));
    }

    #[test]
    fn test_envelope_wire_shape() {
        let env = Versioned::wrap(&Payload { name: "n".into() }, 1).unwrap();
        assert_eq!(
            serde_json::to_value(&env).unwrap(),
            json!({ "schemaVersion": { "1": { "name": "n" } } })
        );
    }

    #[tokio::test]
    async fn test_replica_inserts_default_as_change() {
        let repo = Repo::new("repo-test", RepoConfig::default(), None);
        let handle = repo.create(&Versioned::default()).unwrap();
        let replica = VersionedReplica::new(handle.clone(), "test", 1, Some(make_default));

        let before = handle.revision();
        assert_eq!(replica.read().unwrap(), make_default());
        assert!(handle.revision() > before);

        replica.mutate(|p| p.name = "edited".to_string()).unwrap();
        assert_eq!(replica.read().unwrap().name, "edited");
    }

    #[tokio::test]
    async fn test_replica_unsupported_is_error() {
        let repo = Repo::new("repo-test", RepoConfig::default(), None);
        let future = envelope(json!({ "schemaVersion": { "7": { "name": "future" } } }));
        let handle = repo.create(&future).unwrap();
        let replica: VersionedReplica<Payload> =
            VersionedReplica::new(handle, "test", 1, Some(make_default));

        let err = replica.read().unwrap_err();
        assert!(matches!(
            err,
            PincalError::UnsupportedSchemaVersion { version: 7, .. }
        ));
        assert!(replica.mutate(|_| ()).is_err());
    }
}
