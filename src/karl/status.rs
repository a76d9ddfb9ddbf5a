//! Status aggregation: replay the keepalive log over a time window, join
//! with the store, and shape the per-machine report.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::KarlInner;
use super::schema::{BuildInfo, ClaireBuildInfo, RuntimeStatus, ServiceKey};
use crate::karl::schema::RegisteredState;
use crate::stream::Persister;
use crate::time::format_interval_us;

const DEFAULT_WINDOW_US: u64 = 5 * 60 * 1_000_000;
const NTP_OK_THRESHOLD_US: i64 = 100_000;

/// Whether a service looked alive at the end of the window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CurrentServiceState {
    Up {
        start_time_epoch_microseconds: u64,
        last_keepalive_received: String,
        last_keepalive_received_epoch_microseconds: u64,
        uptime: String,
    },
    Down {
        start_time_epoch_microseconds: u64,
        last_keepalive_received: String,
        last_keepalive_received_epoch_microseconds: u64,
        last_confirmed_uptime: String,
    },
}

/// One service row of the status report.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceToReport {
    pub currently: CurrentServiceState,
    pub service: String,
    pub codename: String,
    pub location: ServiceKey,
    /// Dependencies resolved to codenames seen in the window.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Dependencies nobody reported for; listed as status-page URLs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved_dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildInfo>,
    pub url_status_page_direct: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_status_page_proxied: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeStatus>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MachineReport {
    pub services: BTreeMap<String, ServiceToReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_skew: Option<String>,
}

/// The whole report for one `[from, to)` window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KarlStatus {
    pub now: u64,
    pub from: u64,
    pub to: u64,
    pub machines: BTreeMap<String, MachineReport>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub builds: BTreeMap<String, ClaireBuildInfo>,
    pub generation_time_us: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseFormat {
    JsonFull,
    JsonMinimal,
    Dot,
    Html,
}

#[derive(Clone, Debug)]
pub(crate) struct StatusQuery {
    pub from: u64,
    pub to: u64,
    pub active_only: bool,
    pub format: ResponseFormat,
}

fn parse_us(query: &HashMap<String, String>, key: &str) -> Option<u64> {
    query.get(key).and_then(|value| value.parse().ok())
}

fn parse_unit(query: &HashMap<String, String>, key: &str, unit_us: f64) -> Option<u64> {
    query
        .get(key)
        .and_then(|value| value.parse::<f64>().ok())
        .map(|value| (value * unit_us) as u64)
}

/// Parses the window, filter, and response-type parameters.
pub(crate) fn parse_status_query(
    query: &HashMap<String, String>,
    accept: Option<&str>,
    now: u64,
) -> StatusQuery {
    let from = parse_us(query, "from")
        .or_else(|| parse_unit(query, "m", 60e6).map(|us| now.saturating_sub(us)))
        .or_else(|| parse_unit(query, "h", 3600e6).map(|us| now.saturating_sub(us)))
        .or_else(|| parse_unit(query, "d", 86400e6).map(|us| now.saturating_sub(us)))
        .unwrap_or_else(|| now.saturating_sub(DEFAULT_WINDOW_US));
    let to = parse_us(query, "to")
        .or_else(|| parse_us(query, "interval_us").map(|us| from.saturating_add(us)))
        .unwrap_or(now);

    let format = if query.contains_key("full") {
        ResponseFormat::JsonFull
    } else if query.contains_key("json") {
        ResponseFormat::JsonMinimal
    } else if query.contains_key("dot") {
        ResponseFormat::Dot
    } else if accept.is_some_and(accepts_html) {
        ResponseFormat::Html
    } else {
        ResponseFormat::JsonMinimal
    };

    StatusQuery {
        from,
        to,
        active_only: query.contains_key("active_only"),
        format,
    }
}

/// `Accept: text/html; charset=...` and friends select the HTML rendering.
fn accepts_html(accept: &str) -> bool {
    accept
        .split(',')
        .filter_map(|item| item.split(';').next())
        .any(|media| media.trim() == "text/html")
}

pub(crate) fn time_skew_band(behind_this_by_us: i64) -> String {
    if behind_this_by_us.abs() < NTP_OK_THRESHOLD_US {
        "NTP OK".to_string()
    } else if behind_this_by_us > 0 {
        format!("behind by {:.1}s", behind_this_by_us as f64 * 1e-6)
    } else {
        format!("ahead by {:.1}s", behind_this_by_us.unsigned_abs() as f64 * 1e-6)
    }
}

struct ProtoReport {
    currently: CurrentServiceState,
    dependencies: Vec<ServiceKey>,
    runtime: Option<RuntimeStatus>,
}

/// Builds the report: one replay pass over the keepalive log, then one
/// read-only store transaction to resolve locations, builds, and skew.
pub(crate) fn build_status(inner: &KarlInner, query: &StatusQuery) -> KarlStatus {
    let now = inner.clock.now_us();
    let timeout_us = inner.params.service_timeout_interval.as_micros() as u64;

    let mut report_for_codename: HashMap<String, ProtoReport> = HashMap::new();
    let mut codenames_per_service: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut service_key_into_codename: HashMap<ServiceKey, String> = HashMap::new();

    inner.keepalives.with_persister_read(|persister| {
        for entry in persister.iterate_all() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unreadable keepalive entry");
                    continue;
                }
            };
            if entry.us < query.from || entry.us >= query.to {
                continue;
            }
            let keepalive = &entry.entry.keepalive;
            let codename = keepalive.status.codename.clone();
            service_key_into_codename.insert(entry.entry.location.clone(), codename.clone());
            codenames_per_service
                .entry(keepalive.status.service.clone())
                .or_default()
                .insert(codename.clone());

            let age = now.saturating_sub(entry.us);
            let last_keepalive = format!("{} ago", format_interval_us(age));
            let currently = if age < timeout_us {
                CurrentServiceState::Up {
                    start_time_epoch_microseconds: keepalive.status.start_time_epoch_microseconds,
                    last_keepalive_received: last_keepalive,
                    last_keepalive_received_epoch_microseconds: entry.us,
                    uptime: format_interval_us(
                        keepalive.status.uptime_epoch_microseconds.saturating_add(age),
                    ),
                }
            } else {
                CurrentServiceState::Down {
                    start_time_epoch_microseconds: keepalive.status.start_time_epoch_microseconds,
                    last_keepalive_received: last_keepalive,
                    last_keepalive_received_epoch_microseconds: entry.us,
                    last_confirmed_uptime: keepalive.status.uptime.clone(),
                }
            };
            report_for_codename.insert(
                codename,
                ProtoReport {
                    currently,
                    dependencies: keepalive.status.dependencies.clone(),
                    runtime: keepalive.runtime.clone(),
                },
            );
        }
    });

    let external_url = inner.external_url.clone();
    let route_prefix = inner
        .params
        .nginx
        .as_ref()
        .map(|nginx| nginx.route_prefix.clone());

    let mut status = inner.store.read_only(|fields| {
        let mut status = KarlStatus {
            now,
            from: query.from,
            to: query.to,
            machines: BTreeMap::new(),
            builds: BTreeMap::new(),
            generation_time_us: 0,
        };
        for (service, codenames) in &codenames_per_service {
            for codename in codenames {
                let Some(report) = report_for_codename.get(codename) else {
                    continue;
                };
                let persisted = fields.claires.get(codename);
                if query.active_only
                    && persisted
                        .is_some_and(|claire| claire.registered_state != RegisteredState::Active)
                {
                    continue;
                }
                // Codenames with no store record are zombies: keepalives in
                // the window, but nothing ever registered them.
                let location = persisted.map(|claire| claire.location.clone()).unwrap_or(
                    ServiceKey {
                        ip: format!("zombie/{codename}"),
                        port: 0,
                        prefix: "/".to_string(),
                    },
                );

                let mut dependencies = Vec::new();
                let mut unresolved_dependencies = Vec::new();
                for dependency in &report.dependencies {
                    match service_key_into_codename.get(dependency) {
                        Some(resolved) => dependencies.push(resolved.clone()),
                        None => unresolved_dependencies.push(dependency.status_page_url()),
                    }
                }

                let build = fields.builds.get(codename).cloned();
                if let Some(build) = &build {
                    status.builds.insert(codename.clone(), build.clone());
                }

                let blob = ServiceToReport {
                    currently: report.currently.clone(),
                    service: service.clone(),
                    codename: codename.clone(),
                    url_status_page_direct: location.status_page_url(),
                    url_status_page_proxied: route_prefix
                        .as_ref()
                        .map(|prefix| format!("{external_url}{prefix}/{codename}")),
                    location: location.clone(),
                    dependencies,
                    unresolved_dependencies,
                    build: build.map(|build| build.build),
                    runtime: report.runtime.clone(),
                };
                status
                    .machines
                    .entry(location.ip)
                    .or_default()
                    .services
                    .insert(codename.clone(), blob);
            }
        }
        for (ip, machine) in &mut status.machines {
            if let Some(server) = fields.servers.get(ip) {
                machine.time_skew = Some(time_skew_band(server.behind_this_by));
            }
        }
        status
    });

    status.generation_time_us = inner.clock.now_us().saturating_sub(now);
    status
}
