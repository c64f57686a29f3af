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

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Bandwidth and connection counters keyed by `"host:port"`.
///
/// Not in the critical path for correctness; counting is a no-op unless
/// the manager has started it.
#[derive(Default)]
pub struct ConnectionManager {
    counters: Mutex<Counters>,
    status: Mutex<ConnectionStatus>,
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct Counters {
    incoming: HashMap<String, u64>,
    outgoing: HashMap<String, u64>,
    incoming_connected: HashSet<String>,
    outgoing_connected: HashSet<String>,
}

/// Snapshot of observed traffic.
#[derive(Clone, Debug, Default)]
pub struct ConnectionStatus {
    pub incoming_bps: HashMap<String, f64>,
    pub outgoing_bps: HashMap<String, f64>,
    pub total_received: u64,
    pub total_sent: u64,
    pub total_incoming_mbs: f64,
    pub total_outgoing_mbs: f64,
    pub max_incoming_mbs: f64,
    pub max_outgoing_mbs: f64,
    pub incoming_connections: usize,
    pub outgoing_connections: usize,
}

impl ConnectionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.lock().unwrap().clone()
    }

    pub fn sent_data(&self, host_and_port: &str, size: u64) {
        if self.running.load(Ordering::Relaxed) {
            *self
                .counters
                .lock()
                .unwrap()
                .outgoing
                .entry(host_and_port.to_string())
                .or_insert(0) += size;
        }
    }

    pub fn received_data(&self, host_and_port: &str, size: u64) {
        if self.running.load(Ordering::Relaxed) {
            *self
                .counters
                .lock()
                .unwrap()
                .incoming
                .entry(host_and_port.to_string())
                .or_insert(0) += size;
        }
    }

    pub fn connection_made(&self, host_and_port: &str) {
        if self.running.load(Ordering::Relaxed) {
            self.counters
                .lock()
                .unwrap()
                .outgoing_connected
                .insert(host_and_port.to_string());
        }
    }

    pub fn connection_received(&self, host_and_port: &str) {
        if self.running.load(Ordering::Relaxed) {
            self.counters
                .lock()
                .unwrap()
                .incoming_connected
                .insert(host_and_port.to_string());
        }
    }

    pub fn outgoing_connection_lost(&self, host_and_port: &str) {
        if self.running.load(Ordering::Relaxed) {
            self.counters
                .lock()
                .unwrap()
                .outgoing_connected
                .remove(host_and_port);
        }
    }

    pub fn incoming_connection_lost(&self, host_and_port: &str) {
        if self.running.load(Ordering::Relaxed) {
            self.counters
                .lock()
                .unwrap()
                .incoming_connected
                .remove(host_and_port);
        }
    }

    /// Starts the sampling task; restarts from scratch if running.
    pub fn start(self: &Arc<Self>) {
        self.stop();
        self.running.store(true, Ordering::Relaxed);
        let manager = self.clone();
        let task = tokio::spawn(async move {
            let mut last = Instant::now();
            loop {
                tokio::time::sleep(SAMPLE_INTERVAL).await;
                let now = Instant::now();
                manager.fold_sample(now.duration_since(last).as_secs_f64());
                last = now;
            }
        });
        *self.task.lock().unwrap() = Some(task);
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        self.running.store(false, Ordering::Relaxed);
        *self.counters.lock().unwrap() = Counters::default();
        *self.status.lock().unwrap() = ConnectionStatus::default();
    }

    fn fold_sample(&self, elapsed: f64) {
        let mut counters = self.counters.lock().unwrap();
        let mut status = self.status.lock().unwrap();
        status.incoming_bps.clear();
        status.outgoing_bps.clear();
        for (key, sent) in counters.outgoing.drain() {
            status.total_sent += sent;
            status.outgoing_bps.insert(key, sent as f64 / elapsed);
        }
        for (key, received) in counters.incoming.drain() {
            status.total_received += received;
            status.incoming_bps.insert(key, received as f64 / elapsed);
        }
        status.total_outgoing_mbs = status.outgoing_bps.values().sum::<f64>() / 1_000_000.0;
        status.total_incoming_mbs = status.incoming_bps.values().sum::<f64>() / 1_000_000.0;
        status.max_outgoing_mbs = status.max_outgoing_mbs.max(status.total_outgoing_mbs);
        status.max_incoming_mbs = status.max_incoming_mbs.max(status.total_incoming_mbs);
        status.incoming_connections = counters.incoming_connected.len();
        status.outgoing_connections = counters.outgoing_connected.len();
    }
}
