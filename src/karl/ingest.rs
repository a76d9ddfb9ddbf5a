//! Keepalive ingestion: parse, validate, transact, publish.
//!
//! The store transaction commits before the keepalive is published, so an
//! observer of the keepalive stream never sees a report whose store effects
//! are not yet visible. Ingest failures before the transaction leave the
//! store untouched.

use thiserror::Error;

use super::KarlInner;
use super::schema::{
    ClaireBuildInfo, ClaireInfo, ClaireServiceStatus, ClaireStatus, PersistedKeepalive,
    RegisteredState, ServerInfo, ServiceKey,
};
use crate::store::StoreError;
use crate::stream::StreamError;
use crate::sync_util::lock;

/// Skew changes below this are noise and do not touch `servers`.
pub(crate) const SKEW_EPSILON_US: i64 = 50_000;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("inconsistent URL/body parameters")]
    InconsistentParameters,
    #[error("confirmation callback failed: {reason}")]
    Callback { reason: String },
    #[error("keepalive stream is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Stream(StreamError),
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Stream(StreamError::ShuttingDown) => IngestError::ShuttingDown,
            other => IngestError::Store(other),
        }
    }
}

impl From<StreamError> for IngestError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::ShuttingDown => IngestError::ShuttingDown,
            other => IngestError::Stream(other),
        }
    }
}

/// Handles one POSTed keepalive body. `codename_hint` / `port_hint` are the
/// query-string cross-checks; a mismatch rejects the report.
pub(crate) fn process_keepalive(
    inner: &KarlInner,
    remote_ip: &str,
    codename_hint: Option<&str>,
    port_hint: Option<&str>,
    json: &str,
) -> Result<(), IngestError> {
    let base: ClaireStatus = serde_json::from_str(json)?;
    if let Some(hint) = codename_hint
        && hint != base.codename
    {
        return Err(IngestError::InconsistentParameters);
    }
    if let Some(hint) = port_hint
        && hint.parse::<u16>() != Ok(base.local_port)
    {
        return Err(IngestError::InconsistentParameters);
    }
    let status: ClaireServiceStatus = ClaireServiceStatus::parse(json)?;

    let location = ServiceKey::new(remote_ip, base.local_port);
    let now = inner.clock.now_us();
    let behind_this_by = base
        .last_successful_ping_epoch_microseconds
        .map(|ping| now as i64 - base.now as i64 - ping as i64 / 2);

    inner.store.read_write(|txn| {
        if let Some(behind) = behind_this_by {
            let needs_update = match txn.server(remote_ip) {
                Some(server) => (server.behind_this_by - behind).abs() >= SKEW_EPSILON_US,
                None => true,
            };
            if needs_update {
                txn.upsert_server(ServerInfo {
                    ip: remote_ip.to_string(),
                    behind_this_by: behind,
                });
            }
        }

        if let Some(build) = &base.build {
            let stored = txn.build(&base.codename);
            if stored.is_none_or(|existing| &existing.build != build) {
                txn.upsert_build(ClaireBuildInfo {
                    codename: base.codename.clone(),
                    build: build.clone(),
                });
            }
        }

        let current = txn.claire(&base.codename);
        let needs_upsert = current.as_ref().is_none_or(|claire| {
            claire.location != location
                || claire.registered_state != RegisteredState::Active
        });
        if needs_upsert {
            let mut claire = current.unwrap_or_else(|| ClaireInfo::stub(base.codename.clone()));
            claire.codename = base.codename.clone();
            claire.service = base.service.clone();
            claire.location = location.clone();
            claire.reported_timestamp = now;
            claire.url_status_page_direct = location.status_page_url();
            claire.registered_state = RegisteredState::Active;
            txn.upsert_claire(claire);
        }
        Ok(())
    })?;

    let published = inner.keepalives.publish(PersistedKeepalive {
        location,
        keepalive: status,
    })?;
    {
        let mut latest = lock(&inner.latest_keepalive_index);
        latest.insert(base.codename.clone(), published.index);
    }
    {
        let mut cache = lock(&inner.keepalive_cache);
        let newly_seen = !cache.contains_key(&base.codename);
        cache.insert(base.codename.clone(), now);
        if newly_seen {
            // Only a codename new to the cache can shorten the next timeout
            // deadline; steady-state pings leave the loop asleep.
            inner.timeout_cv.notify_all();
        }
    }
    tracing::debug!(codename = %base.codename, ip = %remote_ip, "keepalive accepted");
    Ok(())
}

/// Handles `DELETE ?codename=X`.
pub(crate) fn deregister(inner: &KarlInner, codename: &str) -> Result<(), StoreError> {
    inner.store.read_write(|txn| {
        let mut claire = txn
            .claire(codename)
            .unwrap_or_else(|| ClaireInfo::stub(codename));
        claire.registered_state = RegisteredState::Deregistered;
        txn.upsert_claire(claire);
        Ok(())
    })?;
    {
        let mut cache = lock(&inner.keepalive_cache);
        cache.remove(codename);
    }
    inner.timeout_cv.notify_all();
    tracing::info!(codename, "service deregistered");
    Ok(())
}
