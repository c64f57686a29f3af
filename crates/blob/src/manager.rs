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

use crate::blob::{Blob, CompletedCallback};
use crate::connection::ConnectionManager;
use crate::index::{BlobIndex, BlobRow};
use nalu_common::conf::Config;
use nalu_common::error::BlobError;
use nalu_common::hash::is_valid_blobhash;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Owner of the blob registry.
///
/// Chooses the storage backend for each blob, reconciles the blob
/// directory with the persistent index on startup, and records rows as
/// blobs complete.
pub struct BlobManager {
    conf: Config,
    save_blobs: AtomicBool,
    index: Arc<dyn BlobIndex>,
    blobs: tokio::sync::Mutex<HashMap<String, Arc<Blob>>>,
    completed_blob_hashes: Mutex<HashSet<String>>,
    connection_manager: Arc<ConnectionManager>,
}

impl BlobManager {
    pub fn new(conf: Config, index: Arc<dyn BlobIndex>) -> Arc<Self> {
        Arc::new(Self {
            save_blobs: AtomicBool::new(conf.save_blobs),
            conf,
            index,
            blobs: tokio::sync::Mutex::new(HashMap::new()),
            completed_blob_hashes: Mutex::new(HashSet::new()),
            connection_manager: ConnectionManager::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.conf
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.connection_manager
    }

    pub fn save_blobs(&self) -> bool {
        self.save_blobs.load(Ordering::Relaxed)
    }

    /// Toggles blob persistence for blobs created from here on; cached
    /// buffers are upgraded lazily by [`BlobManager::get_blob`].
    pub fn set_save_blobs(&self, save_blobs: bool) {
        self.save_blobs.store(save_blobs, Ordering::Relaxed);
    }

    fn completion_callback(self: &Arc<Self>) -> CompletedCallback {
        let manager = Arc::<Self>::downgrade(self);
        Arc::new(move |blob: Arc<Blob>| {
            let Some(manager) = Weak::upgrade(&manager) else {
                return;
            };
            tokio::spawn(async move {
                manager.blob_completed(blob).await;
            });
        })
    }

    fn make_blob(
        self: &Arc<Self>,
        blob_hash: &str,
        length: Option<u64>,
        is_mine: bool,
    ) -> Result<Arc<Blob>, BlobError> {
        let on_disk = is_valid_blobhash(blob_hash) && self.conf.blob_dir.join(blob_hash).is_file();
        if self.save_blobs() || on_disk {
            Blob::new_file(
                &self.conf.blob_dir,
                blob_hash,
                length,
                is_mine,
                Some(self.completion_callback()),
            )
        } else {
            Blob::new_buffer(blob_hash, length, is_mine, Some(self.completion_callback()))
        }
    }

    /// Returns the registry entry for `blob_hash`, creating it if
    /// needed. A cached buffer is upgraded to a file-backed blob when
    /// persistence has been enabled since it was created.
    pub async fn get_blob(
        self: &Arc<Self>,
        blob_hash: &str,
        length: Option<u64>,
        is_mine: bool,
    ) -> Result<Arc<Blob>, BlobError> {
        let mut blobs = self.blobs.lock().await;
        if let Some(existing) = blobs.get(blob_hash).cloned() {
            if self.save_blobs() && existing.is_buffer() {
                self.completed_blob_hashes.lock().unwrap().remove(blob_hash);
                let replacement = self.make_blob(blob_hash, length.or(existing.length()), is_mine)?;
                blobs.insert(blob_hash.to_string(), replacement.clone());
                if existing.is_readable() {
                    let verified_bytes = existing.open_reader()?.read_to_end().await?;
                    replacement.save_verified_blob(&verified_bytes).await?;
                }
                return Ok(replacement);
            }
            if let Some(length) = length {
                if existing.length().is_none() {
                    existing.set_length(length);
                }
            }
            return Ok(existing);
        }
        let blob = self.make_blob(blob_hash, length, is_mine)?;
        blobs.insert(blob_hash.to_string(), blob.clone());
        Ok(blob)
    }

    /// True iff the blob file exists on disk and its registry entry
    /// reports verified.
    pub async fn is_blob_verified(
        self: &Arc<Self>,
        blob_hash: &str,
        length: Option<u64>,
    ) -> Result<bool, BlobError> {
        if !is_valid_blobhash(blob_hash) {
            return Err(BlobError::InvalidBlobHash(blob_hash.to_string()));
        }
        if !self.conf.blob_dir.join(blob_hash).is_file() {
            return Ok(false);
        }
        if let Some(blob) = self.blobs.lock().await.get(blob_hash) {
            return Ok(blob.is_verified());
        }
        Ok(self.make_blob(blob_hash, length, false)?.is_verified())
    }

    pub fn is_blob_completed(&self, blob_hash: &str) -> bool {
        self.completed_blob_hashes.lock().unwrap().contains(blob_hash)
    }

    pub fn completed_blob_hashes(&self) -> HashSet<String> {
        self.completed_blob_hashes.lock().unwrap().clone()
    }

    /// Scans the blob directory, reconciles with the index, and marks
    /// the intersection complete.
    pub async fn setup(self: &Arc<Self>) -> anyhow::Result<()> {
        let blob_dir = self.conf.blob_dir.clone();
        let on_disk = tokio::task::spawn_blocking(move || -> std::io::Result<HashSet<String>> {
            let mut found = HashSet::new();
            for entry in std::fs::read_dir(&blob_dir)? {
                let entry = entry?;
                if let Some(name) = entry.file_name().to_str() {
                    if is_valid_blobhash(name) {
                        found.insert(name.to_string());
                    }
                }
            }
            Ok(found)
        })
        .await??;
        let to_add = self.index.sync_missing_blobs(on_disk).await?;
        if !to_add.is_empty() {
            debug!("marking {} blobs as complete", to_add.len());
            self.completed_blob_hashes.lock().unwrap().extend(to_add);
        }
        if self.conf.track_bandwidth {
            self.connection_manager.start();
        }
        Ok(())
    }

    /// Closes every registry entry and stops bandwidth tracking.
    pub async fn stop(&self) {
        self.connection_manager.stop();
        let mut blobs = self.blobs.lock().await;
        for (_, blob) in blobs.drain() {
            blob.close();
        }
        self.completed_blob_hashes.lock().unwrap().clear();
    }

    /// Invoked by blobs as they become verified; records the row in the
    /// persistent index.
    pub async fn blob_completed(self: &Arc<Self>, blob: Arc<Blob>) {
        let Some(length) = blob.length() else {
            warn!("completed blob {} has no length", blob.blob_hash());
            return;
        };
        let finished = !blob.is_buffer();
        if finished {
            self.completed_blob_hashes
                .lock()
                .unwrap()
                .insert(blob.blob_hash().to_string());
        }
        let row = BlobRow {
            blob_hash: blob.blob_hash().to_string(),
            length,
            added_on: blob.added_on(),
            is_mine: blob.is_mine(),
        };
        if let Err(err) = self.index.add_blobs(&[row], finished).await {
            warn!("failed to persist completed blob {}: {err:#}", blob.blob_hash());
        }
    }

    /// Re-persists rows for the given hashes that are verified on disk,
    /// forcing their status to finished.
    pub async fn ensure_completed_blobs_status(
        self: &Arc<Self>,
        blob_hashes: &[String],
    ) -> anyhow::Result<()> {
        let mut rows = Vec::new();
        for blob_hash in blob_hashes {
            if !self.is_blob_verified(blob_hash, None).await.unwrap_or(false) {
                continue;
            }
            let blob = self.get_blob(blob_hash, None, false).await?;
            if let Some(length) = blob.length() {
                rows.push(BlobRow {
                    blob_hash: blob.blob_hash().to_string(),
                    length,
                    added_on: blob.added_on(),
                    is_mine: blob.is_mine(),
                });
            }
        }
        self.index.add_blobs(&rows, true).await
    }

    /// Removes in-memory state and the backing file for one blob.
    pub async fn delete_blob(self: &Arc<Self>, blob_hash: &str) -> Result<(), BlobError> {
        if !is_valid_blobhash(blob_hash) {
            return Err(BlobError::InvalidBlobHash(blob_hash.to_string()));
        }
        let removed = self.blobs.lock().await.remove(blob_hash);
        match removed {
            Some(blob) => {
                blob.delete();
                self.completed_blob_hashes.lock().unwrap().remove(blob_hash);
            }
            None => {
                let path = self.conf.blob_dir.join(blob_hash);
                if path.is_file() {
                    if let Err(err) = tokio::fs::remove_file(&path).await {
                        warn!("failed to delete blob file {blob_hash}: {err}");
                    }
                }
            }
        }
        Ok(())
    }

    /// Deletes a batch of blobs, optionally removing their index rows.
    /// Files go first; a crash in between leaves stale rows for
    /// [`BlobManager::setup`] to reconcile.
    pub async fn delete_blobs(
        self: &Arc<Self>,
        blob_hashes: &[String],
        delete_from_db: bool,
    ) -> anyhow::Result<()> {
        let deletions = blob_hashes.iter().map(|blob_hash| self.delete_blob(blob_hash));
        for result in futures::future::join_all(deletions).await {
            if let Err(err) = result {
                warn!("delete failed: {err}");
            }
        }
        if delete_from_db {
            self.index.delete_blobs(blob_hashes).await?;
        }
        Ok(())
    }
}
