//! Rendering seam for the status page.
//!
//! The fancy renderer is an external collaborator; this module defines the
//! trait it plugs into and ships a Graphviz DOT emitter plus a bare-bones
//! SVG so the HTML endpoint works without one.

use std::fmt::Write;

use super::status::{CurrentServiceState, KarlStatus};

pub trait RenderStatus: Send + Sync {
    fn as_dot(&self, status: &KarlStatus, name: &str, github_repo_url: &str) -> String;
    fn as_svg(&self, status: &KarlStatus, name: &str, github_repo_url: &str) -> String;
}

/// Default renderer: one node per codename, edges along dependencies.
#[derive(Clone, Copy, Debug, Default)]
pub struct GraphvizRenderer;

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

impl RenderStatus for GraphvizRenderer {
    fn as_dot(&self, status: &KarlStatus, name: &str, github_repo_url: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", escape(name));
        let _ = writeln!(out, "  rankdir=LR;");
        if !github_repo_url.is_empty() {
            let _ = writeln!(out, "  graph [URL=\"{}\"];", escape(github_repo_url));
        }
        for (ip, machine) in &status.machines {
            for (codename, service) in &machine.services {
                let color = match service.currently {
                    CurrentServiceState::Up { .. } => "darkgreen",
                    CurrentServiceState::Down { .. } => "crimson",
                };
                let _ = writeln!(
                    out,
                    "  \"{}\" [label=\"{}\\n{}\\n{}\" color={} URL=\"{}\"];",
                    escape(codename),
                    escape(codename),
                    escape(&service.service),
                    escape(ip),
                    color,
                    escape(&service.url_status_page_direct),
                );
            }
        }
        for machine in status.machines.values() {
            for (codename, service) in &machine.services {
                for dependency in &service.dependencies {
                    let _ = writeln!(
                        out,
                        "  \"{}\" -> \"{}\";",
                        escape(codename),
                        escape(dependency)
                    );
                }
            }
        }
        out.push_str("}\n");
        out
    }

    fn as_svg(&self, status: &KarlStatus, name: &str, _github_repo_url: &str) -> String {
        let mut rows = Vec::new();
        for (ip, machine) in &status.machines {
            for (codename, service) in &machine.services {
                let (state, color) = match service.currently {
                    CurrentServiceState::Up { .. } => ("up", "#1a7f37"),
                    CurrentServiceState::Down { .. } => ("down", "#cf222e"),
                };
                rows.push(format!(
                    "<text x=\"10\" y=\"{}\" fill=\"{}\">{} {} @ {} [{}]</text>",
                    40 + rows.len() * 20,
                    color,
                    xml_escape(codename),
                    xml_escape(&service.service),
                    xml_escape(ip),
                    state,
                ));
            }
        }
        let height = 60 + rows.len() * 20;
        format!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"640\" height=\"{height}\">\
             <text x=\"10\" y=\"20\" font-weight=\"bold\">{}</text>{}</svg>",
            xml_escape(name),
            rows.join("")
        )
    }
}
