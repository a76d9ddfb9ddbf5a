//! Transactional fleet store persisted through a changelog stream.
//!
//! Every committed mutation is one entry of the changelog; reconstructing the
//! in-memory fields is a pure replay of that stream. Readers share an
//! `RwLock` snapshot; writers are exclusive, so a read-only transaction
//! blocks writes for its whole duration.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::karl::schema::{ClaireBuildInfo, ClaireInfo, KarlInfo, ServerInfo};
use crate::stream::{DescribeSchema, PersistError, Persister, Stream, StreamError};
use crate::time::TimeSource;

/// One committed change; the changelog stream's entry type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreMutation {
    ClaireUpsert(ClaireInfo),
    BuildUpsert(ClaireBuildInfo),
    ServerUpsert(ServerInfo),
    KarlAdd(KarlInfo),
}

impl DescribeSchema for StoreMutation {
    fn describe_languages() -> BTreeMap<String, String> {
        BTreeMap::from([(
            "rust".to_string(),
            "enum StoreMutation { ClaireUpsert(ClaireInfo), BuildUpsert(ClaireBuildInfo), \
             ServerUpsert(ServerInfo), KarlAdd(KarlInfo) }"
                .to_string(),
        )])
    }
}

/// The materialised fields. `karl` is append-only; the rest are keyed maps.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Fields {
    pub claires: BTreeMap<String, ClaireInfo>,
    pub builds: BTreeMap<String, ClaireBuildInfo>,
    pub servers: BTreeMap<String, ServerInfo>,
    pub karl: Vec<KarlInfo>,
}

impl Fields {
    fn apply(&mut self, mutation: &StoreMutation) {
        match mutation {
            StoreMutation::ClaireUpsert(claire) => {
                self.claires.insert(claire.codename.clone(), claire.clone());
            }
            StoreMutation::BuildUpsert(build) => {
                self.builds.insert(build.codename.clone(), build.clone());
            }
            StoreMutation::ServerUpsert(server) => {
                self.servers.insert(server.ip.clone(), server.clone());
            }
            StoreMutation::KarlAdd(info) => {
                self.karl.push(info.clone());
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transaction aborted: {reason}")]
    Aborted { reason: String },
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// A read-write transaction. Reads see the snapshot plus this transaction's
/// own pending mutations; nothing is visible outside until commit.
pub struct Transaction<'a> {
    base: &'a Fields,
    pending: Vec<StoreMutation>,
}

impl Transaction<'_> {
    pub fn claire(&self, codename: &str) -> Option<ClaireInfo> {
        for mutation in self.pending.iter().rev() {
            if let StoreMutation::ClaireUpsert(claire) = mutation
                && claire.codename == codename
            {
                return Some(claire.clone());
            }
        }
        self.base.claires.get(codename).cloned()
    }

    pub fn build(&self, codename: &str) -> Option<ClaireBuildInfo> {
        for mutation in self.pending.iter().rev() {
            if let StoreMutation::BuildUpsert(build) = mutation
                && build.codename == codename
            {
                return Some(build.clone());
            }
        }
        self.base.builds.get(codename).cloned()
    }

    pub fn server(&self, ip: &str) -> Option<ServerInfo> {
        for mutation in self.pending.iter().rev() {
            if let StoreMutation::ServerUpsert(server) = mutation
                && server.ip == ip
            {
                return Some(server.clone());
            }
        }
        self.base.servers.get(ip).cloned()
    }

    pub fn upsert_claire(&mut self, claire: ClaireInfo) {
        self.pending.push(StoreMutation::ClaireUpsert(claire));
    }

    pub fn upsert_build(&mut self, build: ClaireBuildInfo) {
        self.pending.push(StoreMutation::BuildUpsert(build));
    }

    pub fn upsert_server(&mut self, server: ServerInfo) {
        self.pending.push(StoreMutation::ServerUpsert(server));
    }

    pub fn add_karl(&mut self, info: KarlInfo) {
        self.pending.push(StoreMutation::KarlAdd(info));
    }
}

/// The store: in-memory fields plus their changelog stream.
pub struct TransactionalStore {
    state: RwLock<Fields>,
    changelog: Stream<StoreMutation>,
}

impl TransactionalStore {
    pub fn open(
        path: impl AsRef<Path>,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self, StoreError> {
        Self::from_stream(Stream::file(path, clock)?)
    }

    pub fn in_memory(clock: Arc<dyn TimeSource>) -> Self {
        // Replay of an empty stream cannot fail.
        Self {
            state: RwLock::new(Fields::default()),
            changelog: Stream::memory(clock),
        }
    }

    /// Reconstructs the fields by replaying the changelog from the start.
    fn from_stream(changelog: Stream<StoreMutation>) -> Result<Self, StoreError> {
        let mut fields = Fields::default();
        changelog.with_persister_read(|persister| -> Result<(), StoreError> {
            for entry in persister.iterate_all() {
                fields.apply(&entry?.entry);
            }
            Ok(())
        })?;
        Ok(Self {
            state: RwLock::new(fields),
            changelog,
        })
    }

    /// Runs `f` against an immutable snapshot, consistent across all fields.
    /// Writes are blocked until `f` returns.
    pub fn read_only<T>(&self, f: impl FnOnce(&Fields) -> T) -> T {
        let fields = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&fields)
    }

    /// Runs `f` in a read-write transaction. All of its mutations commit
    /// atomically with respect to other transactions: each one is appended to
    /// the changelog, then applied in memory. An `Err` from `f` discards the
    /// pending mutations.
    pub fn read_write<T>(
        &self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut fields = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut txn = Transaction {
            base: &*fields,
            pending: Vec::new(),
        };
        let value = f(&mut txn)?;
        let pending = txn.pending;
        for mutation in &pending {
            self.changelog.publish(mutation.clone())?;
        }
        for mutation in &pending {
            fields.apply(mutation);
        }
        Ok(value)
    }

    /// The changelog stream, exposed so collaborators can observe progress.
    pub fn internal_expose_stream(&self) -> &Stream<StoreMutation> {
        &self.changelog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::karl::schema::{BuildInfo, RegisteredState};
    use crate::test_harness::TestClock;

    fn test_store() -> TransactionalStore {
        TransactionalStore::in_memory(Arc::new(TestClock::new(1_000_000)))
    }

    fn claire(codename: &str) -> ClaireInfo {
        ClaireInfo {
            codename: codename.to_string(),
            service: "svc".to_string(),
            ..ClaireInfo::default()
        }
    }

    #[test]
    fn committed_mutations_are_visible_and_logged() {
        let store = test_store();
        store
            .read_write(|txn| {
                txn.upsert_claire(claire("alpha"));
                txn.upsert_server(ServerInfo {
                    ip: "1.2.3.4".to_string(),
                    behind_this_by: 42,
                });
                Ok(())
            })
            .unwrap();

        store.read_only(|fields| {
            assert_eq!(fields.claires["alpha"].service, "svc");
            assert_eq!(fields.servers["1.2.3.4"].behind_this_by, 42);
        });
        assert_eq!(store.internal_expose_stream().size(), 2);
    }

    #[test]
    fn failed_transaction_rolls_back_everything() {
        let store = test_store();
        let result: Result<(), StoreError> = store.read_write(|txn| {
            txn.upsert_claire(claire("alpha"));
            Err(StoreError::Aborted {
                reason: "changed my mind".to_string(),
            })
        });
        assert!(result.is_err());
        store.read_only(|fields| assert!(fields.claires.is_empty()));
        assert_eq!(store.internal_expose_stream().size(), 0);
    }

    #[test]
    fn transaction_reads_its_own_pending_writes() {
        let store = test_store();
        store
            .read_write(|txn| {
                assert!(txn.claire("alpha").is_none());
                txn.upsert_claire(claire("alpha"));
                let mut seen = txn.claire("alpha").expect("pending upsert visible");
                seen.registered_state = RegisteredState::Deregistered;
                txn.upsert_claire(seen);
                assert_eq!(
                    txn.claire("alpha").unwrap().registered_state,
                    RegisteredState::Deregistered
                );
                Ok(())
            })
            .unwrap();
        store.read_only(|fields| {
            assert_eq!(
                fields.claires["alpha"].registered_state,
                RegisteredState::Deregistered
            );
        });
    }

    #[test]
    fn replaying_the_changelog_twice_reaches_the_same_state() {
        let clock = Arc::new(TestClock::new(1_000_000));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let expected = {
            let store =
                TransactionalStore::open(&path, clock.clone()).unwrap();
            store
                .read_write(|txn| {
                    txn.upsert_claire(claire("alpha"));
                    txn.upsert_build(ClaireBuildInfo {
                        codename: "alpha".to_string(),
                        build: BuildInfo {
                            git_commit: "abc".to_string(),
                            ..BuildInfo::default()
                        },
                    });
                    txn.add_karl(KarlInfo {
                        timestamp_us: 1,
                        up: true,
                        persisted_keepalives_info: None,
                    });
                    Ok(())
                })
                .unwrap();
            store.read_only(Fields::clone)
        };

        let replayed_once = TransactionalStore::open(&path, clock.clone())
            .unwrap()
            .read_only(Fields::clone);
        let replayed_twice = TransactionalStore::open(&path, clock)
            .unwrap()
            .read_only(Fields::clone);
        assert_eq!(replayed_once, expected);
        assert_eq!(replayed_twice, expected);
    }
}
