//! Reverse-proxy config sync.
//!
//! Whenever the store's changelog advances, the active claires are re-emitted
//! as proxy locations. Writing and reloading the actual proxy is an external
//! concern behind [`ProxyConfigWriter`]; the bundled implementation renders
//! the config to a file and leaves the reload to the operator's watcher.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::karl::schema::RegisteredState;
use crate::store::TransactionalStore;

#[derive(Debug, Error)]
pub enum NginxError {
    #[error("reverse proxy config requested but no writer is available")]
    NotAvailable,
    #[error("reverse proxy port must be non-zero")]
    InvalidPort,
    #[error("failed to write proxy config: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct NginxParameters {
    pub port: u16,
    pub config_file: PathBuf,
    pub route_prefix: String,
}

impl NginxParameters {
    pub fn new(port: u16, config_file: impl Into<PathBuf>) -> Self {
        Self {
            port,
            config_file: config_file.into(),
            route_prefix: "/live".to_string(),
        }
    }
}

pub trait ProxyConfigWriter: Send + Sync {
    fn is_available(&self) -> bool;
    fn write_and_reload(&self, config_file: &Path, config_text: &str) -> Result<(), NginxError>;
}

/// Writes the rendered config to disk. Reloading is left to whatever watches
/// the file.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileConfigWriter;

impl ProxyConfigWriter for FileConfigWriter {
    fn is_available(&self) -> bool {
        true
    }

    fn write_and_reload(&self, config_file: &Path, config_text: &str) -> Result<(), NginxError> {
        std::fs::write(config_file, config_text)?;
        Ok(())
    }
}

/// One `server { ... }` block of proxy-pass locations.
pub struct ServerDirective {
    port: u16,
    locations: Vec<(String, String)>,
}

impl ServerDirective {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            locations: Vec::new(),
        }
    }

    pub fn proxy_pass(&mut self, route: impl Into<String>, upstream: impl Into<String>) {
        self.locations.push((route.into(), upstream.into()));
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "server {{");
        let _ = writeln!(out, "  listen {};", self.port);
        for (route, upstream) in &self.locations {
            let _ = writeln!(out, "  location {route} {{");
            let _ = writeln!(out, "    proxy_pass {upstream};");
            let _ = writeln!(out, "  }}");
        }
        out.push_str("}\n");
        out
    }
}

/// Keeps the proxy config in step with the store.
pub struct NginxManager {
    params: NginxParameters,
    karl_port: u16,
    writer: Box<dyn ProxyConfigWriter>,
    last_reflected_size: u64,
    first_run: bool,
}

impl std::fmt::Debug for NginxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NginxManager")
            .field("params", &self.params)
            .field("karl_port", &self.karl_port)
            .field("last_reflected_size", &self.last_reflected_size)
            .field("first_run", &self.first_run)
            .finish()
    }
}

impl NginxManager {
    pub fn new(
        params: NginxParameters,
        karl_port: u16,
        writer: Box<dyn ProxyConfigWriter>,
    ) -> Result<Self, NginxError> {
        if !writer.is_available() {
            return Err(NginxError::NotAvailable);
        }
        if params.port == 0 {
            return Err(NginxError::InvalidPort);
        }
        Ok(Self {
            params,
            karl_port,
            writer,
            last_reflected_size: 0,
            first_run: true,
        })
    }

    /// Rewrites the config when the changelog has advanced. The first call
    /// always writes, so a fresh orchestrator emits a config even with an
    /// empty store.
    pub fn update_if_needed(&mut self, store: &TransactionalStore) -> Result<(), NginxError> {
        let current_size = store.internal_expose_stream().size();
        if !self.first_run && current_size == self.last_reflected_size {
            return Ok(());
        }

        let mut server = ServerDirective::new(self.params.port);
        server.proxy_pass("/", format!("http://localhost:{}/", self.karl_port));
        store.read_only(|fields| {
            for claire in fields.claires.values() {
                if claire.registered_state == RegisteredState::Active {
                    server.proxy_pass(
                        format!("{}/{}", self.params.route_prefix, claire.codename),
                        claire.location.status_page_url(),
                    );
                }
            }
        });

        self.writer
            .write_and_reload(&self.params.config_file, &server.render())?;
        tracing::debug!(
            config = %self.params.config_file.display(),
            size = current_size,
            "proxy config rewritten"
        );
        self.last_reflected_size = current_size;
        self.first_run = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::karl::schema::{ClaireInfo, ServiceKey};
    use crate::test_harness::TestClock;
    use std::sync::Arc;

    fn store_with_claire(state: RegisteredState) -> TransactionalStore {
        let store = TransactionalStore::in_memory(Arc::new(TestClock::new(1_000)));
        store
            .read_write(|txn| {
                txn.upsert_claire(ClaireInfo {
                    codename: "alpha".to_string(),
                    service: "svc".to_string(),
                    location: ServiceKey::new("10.0.0.1", 9000),
                    registered_state: state,
                    ..ClaireInfo::default()
                });
                Ok(())
            })
            .unwrap();
        store
    }

    #[test]
    fn rejects_zero_port() {
        let err = NginxManager::new(
            NginxParameters::new(0, "/tmp/x.conf"),
            7576,
            Box::new(FileConfigWriter),
        )
        .unwrap_err();
        assert!(matches!(err, NginxError::InvalidPort));
    }

    #[test]
    fn active_claires_get_proxy_locations() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("live.conf");
        let store = store_with_claire(RegisteredState::Active);
        let mut manager = NginxManager::new(
            NginxParameters::new(8123, &config),
            7576,
            Box::new(FileConfigWriter),
        )
        .unwrap();

        manager.update_if_needed(&store).unwrap();
        let text = std::fs::read_to_string(&config).unwrap();
        assert!(text.contains("listen 8123;"));
        assert!(text.contains("location /live/alpha {"));
        assert!(text.contains("proxy_pass http://10.0.0.1:9000/.current;"));
        assert!(text.contains("proxy_pass http://localhost:7576/;"));
    }

    #[test]
    fn inactive_claires_are_omitted_and_unchanged_store_skips_writes() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("live.conf");
        let store = store_with_claire(RegisteredState::DisconnectedByTimeout);
        let mut manager = NginxManager::new(
            NginxParameters::new(8123, &config),
            7576,
            Box::new(FileConfigWriter),
        )
        .unwrap();

        manager.update_if_needed(&store).unwrap();
        let text = std::fs::read_to_string(&config).unwrap();
        assert!(!text.contains("alpha"));

        // No changelog growth: the second pass must not rewrite.
        std::fs::remove_file(&config).unwrap();
        manager.update_if_needed(&store).unwrap();
        assert!(!config.exists());
    }
}
