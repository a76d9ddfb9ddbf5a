//! The fleet-keepalive orchestrator.
//!
//! Karl owns two independent streams (the keepalive log and the store's
//! changelog), a transactional view of the fleet, and a timeout worker that
//! flips silent services to `DisconnectedByTimeout`. The HTTP surface is
//! built as an `axum::Router` value and mounted by the launcher.

pub mod http;
pub mod ingest;
pub mod nginx;
pub mod render;
pub mod schema;
pub mod status;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;

use crate::store::{StoreError, TransactionalStore};
use crate::stream::{Stream, StreamError, StreamHandle};
use crate::sync_util::lock;
use crate::time::TimeSource;
use nginx::{FileConfigWriter, NginxError, NginxManager, NginxParameters, ProxyConfigWriter};
use render::{GraphvizRenderer, RenderStatus};
use schema::{KarlInfo, PersistedKeepalive, RegisteredState};

pub use ingest::IngestError;
pub use status::{CurrentServiceState, KarlStatus, MachineReport, ServiceToReport};

const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Error)]
pub enum KarlError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Persist(#[from] crate::stream::PersistError),
    #[error(transparent)]
    Nginx(#[from] NginxError),
    #[error("failed to spawn timeout worker: {0}")]
    SpawnWorker(#[source] std::io::Error),
}

/// Construction parameters; `Default` gives a localhost orchestrator with a
/// 45-second timeout and no reverse proxy.
#[derive(Clone, Debug)]
pub struct KarlParameters {
    pub port: u16,
    /// Mount point of the HTTP surface.
    pub url: String,
    /// Base URL claires are reachable through from the outside;
    /// `{port}` expands to `port`.
    pub external_url: String,
    pub svg_name: String,
    pub github_repo_url: String,
    pub service_timeout_interval: Duration,
    pub nginx: Option<NginxParameters>,
    /// Upper bound on how long the timeout worker sleeps between scans.
    /// Needed when timestamps come from a clock the CV deadline math cannot
    /// see advancing, e.g. a test clock.
    pub timeout_scan_floor: Option<Duration>,
}

impl Default for KarlParameters {
    fn default() -> Self {
        Self {
            port: 7576,
            url: "/".to_string(),
            external_url: "http://localhost:{port}".to_string(),
            svg_name: "Karl".to_string(),
            github_repo_url: String::new(),
            service_timeout_interval: DEFAULT_SERVICE_TIMEOUT,
            nginx: None,
            timeout_scan_floor: None,
        }
    }
}

/// Where a stream keeps its entries.
#[derive(Clone, Debug)]
pub enum StreamBacking {
    Memory,
    File(PathBuf),
}

pub(crate) struct KarlInner {
    pub(crate) params: KarlParameters,
    pub(crate) external_url: String,
    pub(crate) clock: Arc<dyn TimeSource>,
    pub(crate) keepalives: Stream<PersistedKeepalive>,
    pub(crate) store: TransactionalStore,
    /// codename -> timestamp of its last keepalive; the CV pairs with it.
    pub(crate) keepalive_cache: Mutex<HashMap<String, u64>>,
    pub(crate) timeout_cv: Condvar,
    pub(crate) destructing: AtomicBool,
    /// codename -> keepalive-stream index of its latest report (0 = none).
    pub(crate) latest_keepalive_index: Mutex<HashMap<String, u64>>,
    pub(crate) proxy: Option<Mutex<NginxManager>>,
    pub(crate) renderer: Box<dyn RenderStatus>,
}

impl KarlInner {
    pub(crate) fn update_proxy_config(&self) {
        if let Some(manager) = &self.proxy {
            let mut manager = lock(manager);
            if let Err(err) = manager.update_if_needed(&self.store) {
                tracing::warn!(error = %err, "proxy config update failed");
            }
        }
    }
}

/// The orchestrator. Dropping it joins the timeout worker, records the
/// shutdown in the store, and tears down both streams.
pub struct Karl {
    inner: Arc<KarlInner>,
    timeout_worker: Option<JoinHandle<()>>,
}

impl Karl {
    /// Builds an orchestrator with the default renderer and config writer.
    pub fn new(
        params: KarlParameters,
        keepalive_backing: StreamBacking,
        store_backing: StreamBacking,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self, KarlError> {
        Self::with_collaborators(
            params,
            keepalive_backing,
            store_backing,
            clock,
            Box::new(GraphvizRenderer),
            Box::new(FileConfigWriter),
        )
    }

    pub fn with_collaborators(
        mut params: KarlParameters,
        keepalive_backing: StreamBacking,
        store_backing: StreamBacking,
        clock: Arc<dyn TimeSource>,
        renderer: Box<dyn RenderStatus>,
        proxy_writer: Box<dyn ProxyConfigWriter>,
    ) -> Result<Self, KarlError> {
        let external_url = params
            .external_url
            .replace("{port}", &params.port.to_string());

        let proxy = match params.nginx.take() {
            Some(nginx_params) => {
                let manager = NginxManager::new(nginx_params.clone(), params.port, proxy_writer)?;
                params.nginx = Some(nginx_params);
                Some(Mutex::new(manager))
            }
            None => None,
        };

        let keepalives = match keepalive_backing {
            StreamBacking::Memory => Stream::memory(clock.clone()),
            StreamBacking::File(path) => Stream::file(path, clock.clone())?,
        };
        let store = match store_backing {
            StreamBacking::Memory => TransactionalStore::in_memory(clock.clone()),
            StreamBacking::File(path) => TransactionalStore::open(path, clock.clone())?,
        };

        let inner = Arc::new(KarlInner {
            params,
            external_url,
            clock,
            keepalives,
            store,
            keepalive_cache: Mutex::new(HashMap::new()),
            timeout_cv: Condvar::new(),
            destructing: AtomicBool::new(false),
            latest_keepalive_index: Mutex::new(HashMap::new()),
            proxy,
            renderer,
        });

        // Record this orchestrator as up, carrying where the keepalive log
        // ends, and seed the cache with everything still marked Active so
        // services that died during our downtime eventually time out.
        let now = inner.clock.now_us();
        let keepalives_info = inner.keepalives.last_published();
        inner.store.read_write(|txn| {
            txn.add_karl(KarlInfo {
                timestamp_us: now,
                up: true,
                persisted_keepalives_info: keepalives_info,
            });
            Ok(())
        })?;
        let active: Vec<String> = inner.store.read_only(|fields| {
            fields
                .claires
                .values()
                .filter(|claire| claire.registered_state == RegisteredState::Active)
                .map(|claire| claire.codename.clone())
                .collect()
        });
        {
            let mut cache = lock(&inner.keepalive_cache);
            for codename in active {
                cache.insert(codename, now);
            }
        }

        let worker_inner = Arc::clone(&inner);
        let timeout_worker = std::thread::Builder::new()
            .name("karl-timeout".to_string())
            .spawn(move || timeout_loop(&worker_inner))
            .map_err(KarlError::SpawnWorker)?;

        tracing::info!(
            port = inner.params.port,
            timeout_s = inner.params.service_timeout_interval.as_secs(),
            "karl is up"
        );
        Ok(Self {
            inner,
            timeout_worker: Some(timeout_worker),
        })
    }

    /// The orchestrator's HTTP surface, mounted under `params.url`.
    pub fn router(&self) -> axum::Router {
        http::build_router(self.inner.clone())
    }

    /// Weak handle to the keepalive stream, for mounting its raw endpoint.
    pub fn keepalives_handle(&self) -> StreamHandle<PersistedKeepalive> {
        self.inner.keepalives.handle()
    }

    /// Number of services currently believed alive.
    pub fn active_services_count(&self) -> usize {
        lock(&self.inner.keepalive_cache).len()
    }

    /// Read access to the fleet store.
    pub fn store(&self) -> &TransactionalStore {
        &self.inner.store
    }
}

impl Drop for Karl {
    fn drop(&mut self) {
        self.inner.destructing.store(true, Ordering::SeqCst);
        {
            let _cache = lock(&self.inner.keepalive_cache);
            self.inner.timeout_cv.notify_all();
        }
        if let Some(worker) = self.timeout_worker.take() {
            let _ = worker.join();
        }
        let now = self.inner.clock.now_us();
        let result = self.inner.store.read_write(|txn| {
            txn.add_karl(KarlInfo {
                timestamp_us: now,
                up: false,
                persisted_keepalives_info: None,
            });
            Ok(())
        });
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to record shutdown");
        }
    }
}

/// The timeout worker: partition the cache, flip the silent ones in one
/// transaction, sync the proxy config, then sleep until the next candidate
/// deadline or a cache change.
fn timeout_loop(inner: &KarlInner) {
    let timeout_us = inner.params.service_timeout_interval.as_micros() as u64;
    while !inner.destructing.load(Ordering::SeqCst) {
        let now = inner.clock.now_us();
        let mut timed_out = Vec::new();
        let mut most_recent: u64 = 0;
        {
            let mut cache = lock(&inner.keepalive_cache);
            cache.retain(|codename, last| {
                if now.saturating_sub(*last) > timeout_us {
                    timed_out.push(codename.clone());
                    false
                } else {
                    most_recent = most_recent.max(*last);
                    true
                }
            });
        }

        if !timed_out.is_empty() {
            let result = inner.store.read_write(|txn| {
                for codename in &timed_out {
                    let mut claire = txn
                        .claire(codename)
                        .unwrap_or_else(|| schema::ClaireInfo::stub(codename.clone()));
                    claire.registered_state = RegisteredState::DisconnectedByTimeout;
                    txn.upsert_claire(claire);
                }
                Ok(())
            });
            match result {
                Ok(()) => tracing::info!(
                    count = timed_out.len(),
                    "flipped silent services to disconnected"
                ),
                Err(err) => tracing::error!(error = %err, "timeout transaction failed"),
            }
        }

        inner.update_proxy_config();

        let cache = lock(&inner.keepalive_cache);
        if inner.destructing.load(Ordering::SeqCst) {
            break;
        }
        let deadline = if most_recent != 0 {
            let elapsed = inner.clock.now_us().saturating_sub(most_recent);
            Some(Duration::from_micros(
                timeout_us.saturating_sub(elapsed).max(1),
            ))
        } else {
            None
        };
        let wait_for = match (deadline, inner.params.timeout_scan_floor) {
            (Some(deadline), Some(floor)) => Some(deadline.min(floor)),
            (Some(deadline), None) => Some(deadline),
            (None, floor) => floor,
        };
        match wait_for {
            Some(duration) => {
                let _guard = inner
                    .timeout_cv
                    .wait_timeout(cache, duration)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            None => {
                // Nothing alive: sleep until a keepalive or shutdown pokes us.
                let _guard = inner
                    .timeout_cv
                    .wait(cache)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }
}
