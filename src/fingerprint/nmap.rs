//! nmap-backed fingerprinting
//!
//! Runs `nmap -sV -Pn -n [--script vuln] -p <ports> -oX - <host>` and reads the
//! XML report from stdout.

use super::{Fingerprint, ServiceFingerprinter};
use crate::{Result, ScanError};
use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use regex::Regex;
use std::io;
use std::net::IpAddr;
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct NmapFingerprinter {
    nmap_path: String,
    vuln_scan: bool,
}

impl Default for NmapFingerprinter {
    fn default() -> Self {
        Self {
            nmap_path: "nmap".to_string(),
            vuln_scan: false,
        }
    }
}

impl NmapFingerprinter {
    pub fn new(vuln_scan: bool) -> Self {
        Self {
            vuln_scan,
            ..Default::default()
        }
    }

    pub fn with_path(mut self, nmap_path: impl Into<String>) -> Self {
        self.nmap_path = nmap_path.into();
        self
    }

    pub fn build_args(&self, host: IpAddr, ports: &[u16]) -> Vec<String> {
        let mut args: Vec<String> = vec!["-sV".into(), "-Pn".into(), "-n".into()];
        if self.vuln_scan {
            args.push("--script".into());
            args.push("vuln".into());
        }
        if host.is_ipv6() {
            args.push("-6".into());
        }
        let port_list: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
        args.push("-p".into());
        args.push(port_list.join(","));
        args.push("-oX".into());
        args.push("-".into());
        args.push(host.to_string());
        args
    }
}

#[async_trait]
impl ServiceFingerprinter for NmapFingerprinter {
    fn name(&self) -> &str {
        "nmap"
    }

    async fn fingerprint(&self, host: IpAddr, open_tcp_ports: &[u16]) -> Result<Fingerprint> {
        if open_tcp_ports.is_empty() {
            return Ok(Fingerprint::default());
        }

        let args = self.build_args(host, open_tcp_ports);
        log::debug!("Running {} {}", self.nmap_path, args.join(" "));

        let output = Command::new(&self.nmap_path)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    ScanError::FingerprintError(format!("{} not found in PATH", self.nmap_path))
                }
                _ => ScanError::FingerprintError(format!("Failed to execute {}: {}", self.nmap_path, e)),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScanError::FingerprintError(format!(
                "{} exited with {}: {}",
                self.nmap_path,
                output.status,
                stderr.trim()
            )));
        }

        parse_nmap_xml(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Extract services and script findings from nmap `-oX` output
pub fn parse_nmap_xml(xml: &str) -> Result<Fingerprint> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut fingerprint = Fingerprint::default();
    let mut current_port: Option<u16> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if e.name().as_ref() == b"port" {
                    current_port = tcp_port(&e);
                } else {
                    handle_port_child(&e, current_port, &mut fingerprint);
                }
            }
            Ok(Event::Empty(e)) => {
                if e.name().as_ref() != b"port" {
                    handle_port_child(&e, current_port, &mut fingerprint);
                }
            }
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"port" {
                    current_port = None;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ScanError::FingerprintError(format!(
                    "Malformed nmap XML at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    Ok(fingerprint)
}

fn handle_port_child(element: &BytesStart<'_>, port: Option<u16>, fingerprint: &mut Fingerprint) {
    let Some(port) = port else {
        return;
    };
    match element.name().as_ref() {
        b"service" => {
            let description: Vec<String> = ["name", "product", "version"]
                .iter()
                .filter_map(|key| attribute(element, key))
                .filter(|value| !value.is_empty())
                .collect();
            if !description.is_empty() {
                fingerprint.services.insert(port, description.join(" "));
            }
        }
        b"script" => {
            if let Some(id) = attribute(element, "id") {
                let findings = fingerprint.findings.entry(port).or_default();
                if !findings.contains(&id) {
                    findings.push(id);
                }
                if let Some(output) = attribute(element, "output") {
                    for cve in extract_cves(&output) {
                        if !findings.contains(&cve) {
                            findings.push(cve);
                        }
                    }
                }
            }
        }
        _ => {}
    }
}

fn tcp_port(element: &BytesStart<'_>) -> Option<u16> {
    if attribute(element, "protocol").as_deref() != Some("tcp") {
        return None;
    }
    attribute(element, "portid")?.parse().ok()
}

fn attribute(element: &BytesStart<'_>, key: &str) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == key.as_bytes())
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()))
}

lazy_static::lazy_static! {
    static ref CVE_PATTERN: Regex = Regex::new(r"\bCVE-\d{4}-\d{4,}\b").expect("CVE pattern compiles");
}

/// `CVE-YYYY-NNNN...` identifiers mentioned in script output
fn extract_cves(text: &str) -> Vec<String> {
    CVE_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}
