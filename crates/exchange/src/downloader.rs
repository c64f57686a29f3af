// Copyright 2025 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::client::{request_blob, BlobExchangeClient};
use itertools::Itertools;
use nalu_blob::blob::Blob;
use nalu_blob::BlobManager;
use nalu_common::error::BlobError;
use nalu_common::peer::Peer;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Exponent applied to a peer's failure count when computing its ban
/// window.
pub const BAN_FACTOR: f64 = 2.0;

struct RequestOutcome {
    peer: Peer,
    bytes_received: u64,
    client: Option<BlobExchangeClient>,
    error: Option<BlobError>,
    elapsed: Duration,
    skipped: bool,
}

/// Races candidate peers for one blob at a time.
///
/// Candidates arrive in batches over the peer queue (fed by discovery)
/// and are dispatched in score order. Peers that fail without producing
/// a usable connection are ignored for `min(30, failures^2)` seconds;
/// peers that serve data are scored by throughput and their connections
/// kept for reuse.
pub struct BlobDownloader {
    blob_manager: Arc<BlobManager>,
    peer_sender: mpsc::UnboundedSender<Vec<Peer>>,
    peer_queue: mpsc::UnboundedReceiver<Vec<Peer>>,
    outcome_sender: mpsc::UnboundedSender<RequestOutcome>,
    outcomes: mpsc::UnboundedReceiver<RequestOutcome>,
    active_connections: HashMap<Peer, JoinHandle<()>>,
    connections: HashMap<Peer, BlobExchangeClient>,
    scores: HashMap<Peer, f64>,
    failures: HashMap<Peer, u32>,
    ignored: HashMap<Peer, Instant>,
    connection_failures: HashSet<Peer>,
    fixed_peers_handle: Option<JoinHandle<()>>,
}

impl BlobDownloader {
    pub fn new(blob_manager: Arc<BlobManager>) -> Self {
        let (peer_sender, peer_queue) = mpsc::unbounded_channel();
        let (outcome_sender, outcomes) = mpsc::unbounded_channel();
        Self {
            blob_manager,
            peer_sender,
            peer_queue,
            outcome_sender,
            outcomes,
            active_connections: HashMap::new(),
            connections: HashMap::new(),
            scores: HashMap::new(),
            failures: HashMap::new(),
            ignored: HashMap::new(),
            connection_failures: HashSet::new(),
            fixed_peers_handle: None,
        }
    }

    /// Handle for feeding peer batches from discovery.
    pub fn peer_sender(&self) -> mpsc::UnboundedSender<Vec<Peer>> {
        self.peer_sender.clone()
    }

    /// Queues the configured static peers, after the configured delay
    /// when discovery is also running, immediately otherwise.
    pub fn add_fixed_peers(&mut self, fixed_peers: Vec<Peer>, discovery_enabled: bool) {
        if fixed_peers.is_empty() {
            return;
        }
        let delay = if discovery_enabled {
            self.blob_manager.config().fixed_peer_delay()
        } else {
            Duration::ZERO
        };
        let sender = self.peer_sender.clone();
        self.fixed_peers_handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(fixed_peers);
        }));
    }

    fn should_race_continue(&self, blob: &Arc<Blob>) -> bool {
        // probe widely until one connection lands, then tighten
        let max_probes = self.blob_manager.config().max_connections_per_download
            * if self.connections.is_empty() { 10 } else { 1 };
        if self.active_connections.len() >= max_probes {
            return false;
        }
        !(blob.is_verified() || !blob.is_writeable())
    }

    fn spawn_request(&mut self, blob: Arc<Blob>, peer: Peer) {
        let connected = self.connections.remove(&peer);
        let connection_manager = Some(self.blob_manager.connection_manager().clone());
        let connect_timeout = self.blob_manager.config().peer_connect_timeout();
        let download_timeout = self.blob_manager.config().blob_download_timeout();
        let outcome_sender = self.outcome_sender.clone();
        let task_peer = peer.clone();
        let task = tokio::spawn(async move {
            let started = Instant::now();
            if blob.is_verified() {
                let _ = outcome_sender.send(RequestOutcome {
                    peer: task_peer,
                    bytes_received: 0,
                    client: connected,
                    error: None,
                    elapsed: started.elapsed(),
                    skipped: true,
                });
                return;
            }
            let result = request_blob(
                Some(&blob),
                &task_peer,
                connect_timeout,
                download_timeout,
                connected,
                connection_manager,
            )
            .await;
            let _ = outcome_sender.send(RequestOutcome {
                peer: task_peer,
                bytes_received: result.bytes_received,
                client: result.client,
                error: result.error,
                elapsed: started.elapsed(),
                skipped: false,
            });
        });
        self.active_connections.insert(peer, task);
    }

    fn apply_outcome(&mut self, outcome: RequestOutcome) {
        let peer = outcome.peer;
        if outcome.skipped {
            if let Some(client) = outcome.client {
                self.connections.insert(peer, client);
            }
            return;
        }
        if outcome.bytes_received == 0 && outcome.client.is_none() {
            self.connection_failures.insert(peer.clone());
        }
        match outcome.client {
            Some(client) => {
                debug!("keep peer {peer}");
                self.failures.insert(peer.clone(), 0);
                let elapsed = outcome.elapsed.as_secs_f64();
                let score = if outcome.bytes_received > 0 && elapsed > 0.0 {
                    outcome.bytes_received as f64 / elapsed
                } else {
                    1.0
                };
                self.scores.insert(peer.clone(), score);
                self.connections.insert(peer, client);
            }
            None => {
                *self.failures.entry(peer.clone()).or_insert(0) += 1;
                // a peer that delivered bad bytes keeps racing; a peer
                // that produced nothing at all is benched
                let data_error = outcome
                    .error
                    .as_ref()
                    .is_some_and(|error| error.is_data_error());
                if !data_error && !self.ignored.contains_key(&peer) {
                    debug!("drop peer {peer}");
                    self.ignored.insert(peer.clone(), Instant::now());
                }
                self.connections.remove(&peer);
            }
        }
    }

    /// Parks until any in-flight request reports back, or one second
    /// passes.
    async fn new_peer_or_finished(&mut self) {
        tokio::select! {
            outcome = self.outcomes.recv() => {
                if let Some(outcome) = outcome {
                    self.apply_outcome(outcome);
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        while let Ok(outcome) = self.outcomes.try_recv() {
            self.apply_outcome(outcome);
        }
    }

    fn cleanup_active(&mut self) {
        if self.active_connections.is_empty() && self.connections.is_empty() {
            self.clear_banned();
        }
        self.active_connections.retain(|_, task| !task.is_finished());
    }

    fn clear_banned(&mut self) {
        let now = Instant::now();
        let failures = &self.failures;
        self.ignored.retain(|peer, when| {
            let failure_count = failures.get(peer).copied().unwrap_or(0) as f64;
            now.duration_since(*when).as_secs_f64() < f64::min(30.0, failure_count.powf(BAN_FACTOR))
        });
    }

    /// Races peers for one blob until it verifies.
    pub async fn download_blob(
        &mut self,
        blob_hash: &str,
        length: Option<u64>,
    ) -> Result<Arc<Blob>, BlobError> {
        let blob = self.blob_manager.get_blob(blob_hash, length, false).await?;
        if blob.is_verified() {
            return Ok(blob);
        }
        while !blob.is_verified() {
            let mut batch: HashSet<Peer> = self.connections.keys().cloned().collect();
            while let Ok(peers) = self.peer_queue.try_recv() {
                batch.extend(peers);
            }
            debug!(
                "{} running, {} peers, {} ignored, {} active, {} connections",
                &blob_hash[..6],
                batch.len(),
                self.ignored.len(),
                self.active_connections.len(),
                self.connections.len()
            );
            let mut re_add = false;
            let candidates = batch
                .iter()
                .cloned()
                .sorted_by(|a, b| {
                    let score_a = self.scores.get(a).copied().unwrap_or_default();
                    let score_b = self.scores.get(b).copied().unwrap_or_default();
                    score_b.total_cmp(&score_a)
                })
                .collect::<Vec<_>>();
            for peer in candidates {
                if self.ignored.contains_key(&peer) {
                    continue;
                }
                if self.active_connections.contains_key(&peer) {
                    re_add = true;
                    continue;
                }
                if !self.should_race_continue(&blob) {
                    break;
                }
                debug!("request {} from {peer}", &blob_hash[..8]);
                self.spawn_request(blob.clone(), peer);
            }
            if !re_add && !batch.is_empty() {
                // keep unused candidates circulating
                let _ = self.peer_sender.send(batch.into_iter().collect());
            }
            self.new_peer_or_finished().await;
            self.cleanup_active();
        }
        debug!("downloaded {}", &blob_hash[..8]);
        blob.close();
        self.cleanup_active();
        Ok(blob)
    }

    /// Drops connections and racing state; in-flight tasks are aborted.
    pub fn close(&mut self) {
        if let Some(handle) = self.fixed_peers_handle.take() {
            handle.abort();
        }
        for (_, task) in self.active_connections.drain() {
            task.abort();
        }
        self.connections.clear();
        self.connection_failures.clear();
        self.scores.clear();
        self.ignored.clear();
    }

    pub fn peer_score(&self, peer: &Peer) -> Option<f64> {
        self.scores.get(peer).copied()
    }

    pub fn failure_count(&self, peer: &Peer) -> u32 {
        self.failures.get(peer).copied().unwrap_or(0)
    }

    pub fn is_ignored(&self, peer: &Peer) -> bool {
        self.ignored.contains_key(peer)
    }

    #[cfg(test)]
    fn note_failure(&mut self, peer: &Peer, failures: u32, when: Instant) {
        self.failures.insert(peer.clone(), failures);
        self.ignored.insert(peer.clone(), when);
    }
}

impl Drop for BlobDownloader {
    fn drop(&mut self) {
        self.close();
    }
}
