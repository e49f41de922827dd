//! Result aggregation
//!
//! A single collector task owns the canonical `(host, port, protocol) -> result`
//! map. Workers only hold a [`ResultSink`], the sending half of a bounded channel.
//! The snapshot is taken once every sink is dropped and the channel has drained,
//! which is the barrier between scanning and aggregating.

use crate::network::{duration_millis, PortResult, PortState, Protocol};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type ResultKey = (IpAddr, u16, Protocol);

/// Counters gathered while collecting results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    /// Distinct jobs recorded
    pub probes: u64,
    pub open: u64,
    pub closed: u64,
    pub filtered: u64,

    /// Probes that failed and were degraded to filtered
    pub probe_errors: u64,

    /// Results dropped because their key was already recorded
    pub duplicates: u64,

    #[serde(with = "duration_millis")]
    pub min_response_time: Duration,
    #[serde(with = "duration_millis")]
    pub max_response_time: Duration,
    #[serde(with = "duration_millis")]
    pub avg_response_time: Duration,
}

impl ScanStats {
    fn record(&mut self, result: &PortResult, total_response: &mut Duration) {
        self.probes += 1;
        match result.state {
            PortState::Open => self.open += 1,
            PortState::Closed => self.closed += 1,
            PortState::Filtered => self.filtered += 1,
        }
        if result.error.is_some() {
            self.probe_errors += 1;
        }

        if self.probes == 1 || result.response_time < self.min_response_time {
            self.min_response_time = result.response_time;
        }
        if result.response_time > self.max_response_time {
            self.max_response_time = result.response_time;
        }
        *total_response += result.response_time;
    }

    fn finalize(&mut self, total_response: Duration) {
        if self.probes > 0 {
            self.avg_response_time = total_response / self.probes.min(u32::MAX as u64) as u32;
        }
    }
}

/// Read-only snapshot of a finished scan
#[derive(Debug, Clone, Default)]
pub struct ScanResults {
    results: BTreeMap<ResultKey, PortResult>,
    stats: ScanStats,
}

impl ScanResults {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    pub fn get(&self, host: IpAddr, port: u16, protocol: Protocol) -> Option<&PortResult> {
        self.results.get(&(host, port, protocol))
    }

    pub fn state(&self, host: IpAddr, port: u16, protocol: Protocol) -> Option<PortState> {
        self.get(host, port, protocol).map(|r| r.state)
    }

    /// Every result, ordered by host, port, protocol
    pub fn iter(&self) -> impl Iterator<Item = &PortResult> {
        self.results.values()
    }

    pub fn for_host(&self, host: IpAddr) -> Vec<PortResult> {
        self.results
            .range((host, 0, Protocol::Tcp)..=(host, u16::MAX, Protocol::Icmp))
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Open TCP ports of `host`, ascending
    pub fn open_tcp_ports(&self, host: IpAddr) -> Vec<u16> {
        self.for_host(host)
            .into_iter()
            .filter(|r| r.protocol == Protocol::Tcp && r.state == PortState::Open)
            .map(|r| r.port)
            .collect()
    }

    /// `(port, protocol, state)` triples, ignoring timing, for comparing runs
    pub fn classification(&self) -> BTreeMap<ResultKey, PortState> {
        self.results.iter().map(|(k, r)| (*k, r.state)).collect()
    }
}

/// Sending half handed to workers
#[derive(Debug, Clone)]
pub struct ResultSink {
    tx: mpsc::Sender<PortResult>,
}

impl ResultSink {
    /// Hand a result to the collector; `false` once the collector is gone
    pub async fn submit(&self, result: PortResult) -> bool {
        self.tx.send(result).await.is_ok()
    }
}

/// Handle to the collector task
#[derive(Debug)]
pub struct ResultAggregator {
    handle: JoinHandle<ScanResults>,
}

impl ResultAggregator {
    /// Start the collector with a results channel of `buffer` slots
    pub fn spawn(buffer: usize) -> (Self, ResultSink) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = tokio::spawn(collect(rx));
        (Self { handle }, ResultSink { tx })
    }

    /// Wait for the channel to close and return the snapshot
    ///
    /// Every [`ResultSink`] clone must be dropped first, otherwise this waits
    /// forever.
    pub async fn finish(self) -> ScanResults {
        match self.handle.await {
            Ok(results) => results,
            Err(e) => {
                log::error!("Result collector failed: {}", e);
                ScanResults::default()
            }
        }
    }
}

async fn collect(mut rx: mpsc::Receiver<PortResult>) -> ScanResults {
    let mut results: BTreeMap<ResultKey, PortResult> = BTreeMap::new();
    let mut stats = ScanStats::default();
    let mut total_response = Duration::ZERO;

    while let Some(result) = rx.recv().await {
        let key = (result.host, result.port, result.protocol);
        if let Some(existing) = results.get(&key) {
            stats.duplicates += 1;
            log::warn!(
                "Duplicate result for {}:{}/{} dropped (kept {}, got {})",
                key.0,
                key.1,
                key.2,
                existing.state,
                result.state
            );
            continue;
        }
        stats.record(&result, &mut total_response);
        results.insert(key, result);
    }

    stats.finalize(total_response);
    log::debug!(
        "Aggregated {} results ({} open, {} closed, {} filtered)",
        stats.probes,
        stats.open,
        stats.closed,
        stats.filtered
    );
    ScanResults { results, stats }
}
