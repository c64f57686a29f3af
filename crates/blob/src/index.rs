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

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

/// Seconds after which an announced blob must be re-announced.
pub const DATA_EXPIRATION: u64 = 86_400;

/// Whether the blob bytes are on disk or only recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobStatus {
    Pending,
    Finished,
}

/// One blob row as the core hands it to the index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlobRow {
    pub blob_hash: String,
    pub length: u64,
    pub added_on: u64,
    pub is_mine: bool,
}

/// Persistent record of blob metadata.
///
/// The core treats this as an external collaborator: rows are written on
/// completion, reconciled against the blob directory during setup, and
/// consumed by the announcer.
#[async_trait]
pub trait BlobIndex: Send + Sync {
    /// Insert-or-keep rows; when `finished`, force their status to
    /// finished.
    async fn add_blobs(&self, rows: &[BlobRow], finished: bool) -> anyhow::Result<()>;

    /// Reconciles recorded rows against the set of files found on disk.
    /// Rows recorded finished but missing on disk flip to pending; the
    /// returned set is the intersection of `on_disk` and finished rows.
    async fn sync_missing_blobs(
        &self,
        on_disk: HashSet<String>,
    ) -> anyhow::Result<HashSet<String>>;

    async fn delete_blobs(&self, blob_hashes: &[String]) -> anyhow::Result<()>;

    async fn get_blob_status(&self, blob_hash: &str) -> anyhow::Result<Option<BlobStatus>>;

    /// Stamps the last announcement time and schedules the next one.
    async fn update_last_announced_blobs(
        &self,
        blob_hashes: &[String],
        now: u64,
    ) -> anyhow::Result<()>;

    /// Flags finished blobs for a one-off announcement, optionally due
    /// immediately.
    async fn set_should_single_announce(
        &self,
        blob_hashes: &[String],
        immediate: bool,
        now: u64,
    ) -> anyhow::Result<()>;

    /// Finished blobs due for announcement, ordered by due time.
    async fn get_blobs_to_announce(&self, now: u64, limit: usize) -> anyhow::Result<Vec<String>>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredBlob {
    length: u64,
    added_on: u64,
    is_mine: bool,
    status: BlobStatus,
    last_announced_time: Option<u64>,
    next_announce_time: u64,
    single_announce: bool,
}

impl StoredBlob {
    fn from_row(row: &BlobRow, finished: bool) -> Self {
        Self {
            length: row.length,
            added_on: row.added_on,
            is_mine: row.is_mine,
            status: if finished {
                BlobStatus::Finished
            } else {
                BlobStatus::Pending
            },
            last_announced_time: None,
            next_announce_time: 0,
            single_announce: false,
        }
    }
}

/// RocksDB-backed blob index; one JSON row per blob hash.
pub struct RocksBlobIndex {
    db: rocksdb::DB,
}

impl RocksBlobIndex {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let db = rocksdb::DB::open(&Self::db_options(), path).context("rocksdb::DB::open")?;
        Ok(Self { db })
    }

    fn db_options() -> rocksdb::Options {
        let mut options = rocksdb::Options::default();
        options.create_if_missing(true);
        options
    }

    fn get_stored(&self, blob_hash: &str) -> anyhow::Result<Option<StoredBlob>> {
        match self.db.get(blob_hash.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_stored(&self, blob_hash: &str, stored: &StoredBlob) -> anyhow::Result<()> {
        self.db
            .put(blob_hash.as_bytes(), serde_json::to_vec(stored)?)?;
        Ok(())
    }

    fn scan(&self) -> impl Iterator<Item = anyhow::Result<(String, StoredBlob)>> + '_ {
        self.db
            .iterator(rocksdb::IteratorMode::Start)
            .map(|item| {
                let (key, value) = item?;
                let blob_hash = String::from_utf8(key.to_vec()).context("non-utf8 index key")?;
                let stored = serde_json::from_slice(&value)?;
                Ok((blob_hash, stored))
            })
    }
}

#[async_trait]
impl BlobIndex for RocksBlobIndex {
    async fn add_blobs(&self, rows: &[BlobRow], finished: bool) -> anyhow::Result<()> {
        for row in rows {
            let stored = match self.get_stored(&row.blob_hash)? {
                Some(mut existing) => {
                    if finished {
                        existing.status = BlobStatus::Finished;
                    }
                    existing
                }
                None => StoredBlob::from_row(row, finished),
            };
            self.put_stored(&row.blob_hash, &stored)?;
        }
        Ok(())
    }

    async fn sync_missing_blobs(
        &self,
        on_disk: HashSet<String>,
    ) -> anyhow::Result<HashSet<String>> {
        let mut finished = HashSet::new();
        let mut to_update = Vec::new();
        for item in self.scan() {
            let (blob_hash, stored) = item?;
            if stored.status == BlobStatus::Finished {
                if on_disk.contains(&blob_hash) {
                    finished.insert(blob_hash);
                } else {
                    to_update.push((blob_hash, stored));
                }
            }
        }
        for (blob_hash, mut stored) in to_update {
            stored.status = BlobStatus::Pending;
            self.put_stored(&blob_hash, &stored)?;
        }
        Ok(finished)
    }

    async fn delete_blobs(&self, blob_hashes: &[String]) -> anyhow::Result<()> {
        for blob_hash in blob_hashes {
            self.db.delete(blob_hash.as_bytes())?;
        }
        Ok(())
    }

    async fn get_blob_status(&self, blob_hash: &str) -> anyhow::Result<Option<BlobStatus>> {
        Ok(self.get_stored(blob_hash)?.map(|stored| stored.status))
    }

    async fn update_last_announced_blobs(
        &self,
        blob_hashes: &[String],
        now: u64,
    ) -> anyhow::Result<()> {
        for blob_hash in blob_hashes {
            if let Some(mut stored) = self.get_stored(blob_hash)? {
                stored.last_announced_time = Some(now);
                stored.next_announce_time = now + DATA_EXPIRATION / 2;
                stored.single_announce = false;
                self.put_stored(blob_hash, &stored)?;
            }
        }
        Ok(())
    }

    async fn set_should_single_announce(
        &self,
        blob_hashes: &[String],
        immediate: bool,
        now: u64,
    ) -> anyhow::Result<()> {
        for blob_hash in blob_hashes {
            if let Some(mut stored) = self.get_stored(blob_hash)? {
                if stored.status == BlobStatus::Finished {
                    stored.single_announce = true;
                    if immediate {
                        stored.next_announce_time = now;
                    }
                    self.put_stored(blob_hash, &stored)?;
                }
            }
        }
        Ok(())
    }

    async fn get_blobs_to_announce(&self, now: u64, limit: usize) -> anyhow::Result<Vec<String>> {
        let mut due = Vec::new();
        for item in self.scan() {
            let (blob_hash, stored) = item?;
            if stored.status == BlobStatus::Finished && stored.next_announce_time < now {
                due.push((stored.next_announce_time, blob_hash));
            }
        }
        due.sort();
        Ok(due
            .into_iter()
            .take(limit)
            .map(|(_, blob_hash)| blob_hash)
            .collect())
    }
}

/// In-memory blob index for tests and buffer-only nodes.
#[derive(Default)]
pub struct MemoryBlobIndex {
    rows: Mutex<HashMap<String, StoredBlob>>,
}

impl MemoryBlobIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobIndex for MemoryBlobIndex {
    async fn add_blobs(&self, rows: &[BlobRow], finished: bool) -> anyhow::Result<()> {
        let mut stored_rows = self.rows.lock().unwrap();
        for row in rows {
            stored_rows
                .entry(row.blob_hash.clone())
                .and_modify(|existing| {
                    if finished {
                        existing.status = BlobStatus::Finished;
                    }
                })
                .or_insert_with(|| StoredBlob::from_row(row, finished));
        }
        Ok(())
    }

    async fn sync_missing_blobs(
        &self,
        on_disk: HashSet<String>,
    ) -> anyhow::Result<HashSet<String>> {
        let mut stored_rows = self.rows.lock().unwrap();
        let mut finished = HashSet::new();
        for (blob_hash, stored) in stored_rows.iter_mut() {
            if stored.status == BlobStatus::Finished {
                if on_disk.contains(blob_hash) {
                    finished.insert(blob_hash.clone());
                } else {
                    stored.status = BlobStatus::Pending;
                }
            }
        }
        Ok(finished)
    }

    async fn delete_blobs(&self, blob_hashes: &[String]) -> anyhow::Result<()> {
        let mut stored_rows = self.rows.lock().unwrap();
        for blob_hash in blob_hashes {
            stored_rows.remove(blob_hash);
        }
        Ok(())
    }

    async fn get_blob_status(&self, blob_hash: &str) -> anyhow::Result<Option<BlobStatus>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(blob_hash)
            .map(|stored| stored.status))
    }

    async fn update_last_announced_blobs(
        &self,
        blob_hashes: &[String],
        now: u64,
    ) -> anyhow::Result<()> {
        let mut stored_rows = self.rows.lock().unwrap();
        for blob_hash in blob_hashes {
            if let Some(stored) = stored_rows.get_mut(blob_hash) {
                stored.last_announced_time = Some(now);
                stored.next_announce_time = now + DATA_EXPIRATION / 2;
                stored.single_announce = false;
            }
        }
        Ok(())
    }

    async fn set_should_single_announce(
        &self,
        blob_hashes: &[String],
        immediate: bool,
        now: u64,
    ) -> anyhow::Result<()> {
        let mut stored_rows = self.rows.lock().unwrap();
        for blob_hash in blob_hashes {
            if let Some(stored) = stored_rows.get_mut(blob_hash) {
                if stored.status == BlobStatus::Finished {
                    stored.single_announce = true;
                    if immediate {
                        stored.next_announce_time = now;
                    }
                }
            }
        }
        Ok(())
    }

    async fn get_blobs_to_announce(&self, now: u64, limit: usize) -> anyhow::Result<Vec<String>> {
        let stored_rows = self.rows.lock().unwrap();
        let mut due: Vec<_> = stored_rows
            .iter()
            .filter(|(_, stored)| {
                stored.status == BlobStatus::Finished && stored.next_announce_time < now
            })
            .map(|(blob_hash, stored)| (stored.next_announce_time, blob_hash.clone()))
            .collect();
        due.sort();
        Ok(due
            .into_iter()
            .take(limit)
            .map(|(_, blob_hash)| blob_hash)
            .collect())
    }
}
