//! Wire and store types for the fleet: keepalive payloads reported by
//! claires, and the records the orchestrator keeps about them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::stream::{DescribeSchema, IdxTs};

fn default_prefix() -> String {
    "/".to_string()
}

/// The `(ip, port, prefix)` triple addressing a worker's status page.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub ip: String,
    pub port: u16,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl ServiceKey {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            prefix: default_prefix(),
        }
    }

    pub fn status_page_url(&self) -> String {
        format!("http://{}:{}{}.current", self.ip, self.port, self.prefix)
    }
}

impl Default for ServiceKey {
    fn default() -> Self {
        Self::new("", 0)
    }
}

/// Build metadata a worker reports about its own binary.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub git_commit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_dirty: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_time_epoch_microseconds: Option<u64>,
}

/// Worker-specific payload inside a keepalive; a closed tagged sum.
///
/// Unknown tags fail only the rich parse, never the keepalive itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeStatus {
    Basic(BasicRuntimeStatus),
    Counters(CountersRuntimeStatus),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BasicRuntimeStatus {
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CountersRuntimeStatus {
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
}

/// The base self-report every claire sends.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaireStatus {
    pub codename: String,
    pub service: String,
    pub local_port: u16,
    /// The worker's own clock at send time, epoch microseconds.
    pub now: u64,
    #[serde(default)]
    pub start_time_epoch_microseconds: u64,
    #[serde(default)]
    pub uptime: String,
    #[serde(default)]
    pub uptime_epoch_microseconds: u64,
    /// Round-trip of the worker's previous successful ping, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_ping_epoch_microseconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<ServiceKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildInfo>,
}

/// The rich self-report: the base status plus the runtime variant.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaireServiceStatus {
    #[serde(flatten)]
    pub status: ClaireStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeStatus>,
}

impl ClaireServiceStatus {
    /// Parses a keepalive body: the rich form when it fully deserialises,
    /// otherwise the base status with `runtime` left empty.
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        let base: ClaireStatus = serde_json::from_str(json)?;
        match serde_json::from_str::<ClaireServiceStatus>(json) {
            Ok(rich) => Ok(rich),
            Err(_) => Ok(Self {
                status: base,
                runtime: None,
            }),
        }
    }
}

/// One record of the keepalive stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedKeepalive {
    pub location: ServiceKey,
    pub keepalive: ClaireServiceStatus,
}

impl DescribeSchema for PersistedKeepalive {
    fn describe_languages() -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "rust".to_string(),
                "struct PersistedKeepalive { location: ServiceKey, keepalive: ClaireServiceStatus }"
                    .to_string(),
            ),
            (
                "markdown".to_string(),
                "`location` — the `(ip, port, prefix)` key of the reporting worker.\n\
                 `keepalive` — the worker's full self-report, runtime variant included."
                    .to_string(),
            ),
        ])
    }
}

/// Registration lifecycle of a claire, keyed by codename.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisteredState {
    #[default]
    Active,
    DisconnectedByTimeout,
    Deregistered,
}

/// What the store remembers about a claire.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaireInfo {
    pub codename: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub location: ServiceKey,
    #[serde(default)]
    pub reported_timestamp: u64,
    #[serde(default)]
    pub url_status_page_direct: String,
    #[serde(default)]
    pub registered_state: RegisteredState,
}

impl ClaireInfo {
    /// The stub record used when a lifecycle flip arrives for a codename the
    /// store has never seen.
    pub fn stub(codename: impl Into<String>) -> Self {
        Self {
            codename: codename.into(),
            ..Self::default()
        }
    }
}

/// Build metadata by codename.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaireBuildInfo {
    pub codename: String,
    pub build: BuildInfo,
}

/// Per-server clock skew, keyed by ip. Positive means the server's clock is
/// behind the orchestrator's.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub ip: String,
    pub behind_this_by: i64,
}

/// One record of the orchestrator's own lifecycle log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KarlInfo {
    pub timestamp_us: u64,
    pub up: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persisted_keepalives_info: Option<IdxTs>,
}

/// The latest keepalive of one codename, as served by `/snapshot`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotOfKeepalive {
    /// `entry_us - now`; negative, since the entry predates the request.
    pub age_us: i64,
    pub keepalive: ClaireServiceStatus,
}

/// Body of `404` responses on the orchestrator surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
