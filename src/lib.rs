#![forbid(unsafe_code)]

//! Fleet-keepalive orchestration on persistent typed event streams.
//!
//! The crate has two halves. [`stream`] is a standalone append-only typed
//! log with fan-out subscription, usable on its own. [`karl`] is the
//! orchestrator built on top of it: keepalive ingestion, a transactional
//! fleet store replayed from a changelog stream, timeout detection, and the
//! status HTTP surface. Owners wrap it all in a thin launcher (see `karld`).

pub mod config;
pub mod error;
pub mod karl;
pub mod store;
pub mod stream;
pub mod telemetry;
pub mod test_harness;
pub mod time;

pub(crate) mod query;
pub(crate) mod sync_util;

pub use error::{Error, Result};

pub use crate::karl::schema::{
    BuildInfo, ClaireBuildInfo, ClaireInfo, ClaireServiceStatus, ClaireStatus, KarlInfo,
    PersistedKeepalive, RegisteredState, RuntimeStatus, ServerInfo, ServiceKey,
    SnapshotOfKeepalive,
};
pub use crate::karl::{Karl, KarlParameters, KarlStatus, StreamBacking};
pub use crate::store::{StoreMutation, TransactionalStore};
pub use crate::stream::{
    DataAuthority, Entry, EntryResponse, IdxTs, Stream, StreamEntry, StreamError,
    StreamSubscriber, SubscriberScope, TerminationResponse,
};
pub use crate::time::{TimeSource, WallClock};
