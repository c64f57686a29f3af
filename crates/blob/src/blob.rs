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

use crate::cipher::decrypt_blob_bytes;
use crate::now_timestamp;
use crate::writer::HashBlobWriter;
use nalu_common::error::BlobError;
use nalu_common::hash::{is_valid_blobhash, MAX_BLOB_SIZE};
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

/// Writers are admitted per remote endpoint; local writers use `(None, None)`.
pub type WriterKey = (Option<IpAddr>, Option<u16>);

/// Invoked once when a blob transitions to verified.
pub type CompletedCallback = Arc<dyn Fn(Arc<Blob>) + Send + Sync>;

struct WriterEntry {
    closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct BlobState {
    length: Option<u64>,
    writing: bool,
    readers: usize,
    buffer: Option<Vec<u8>>,
    writers: HashMap<WriterKey, WriterEntry>,
}

/// A chunk of data (up to 2MB) available on the network, identified by
/// the sha384 hash of its contents.
///
/// A blob is either backed by a file under the blob directory or by an
/// in-memory buffer that is discarded once read. Readers only open after
/// the `verified` transition; at most one writer per remote endpoint may
/// be ingesting at a time, and the first writer to produce verified
/// bytes wins.
pub struct Blob {
    blob_hash: String,
    added_on: u64,
    is_mine: bool,
    file_path: Option<PathBuf>,
    state: Mutex<BlobState>,
    verified: watch::Sender<bool>,
    on_completed: Option<CompletedCallback>,
}

impl Blob {
    /// Creates an in-memory blob.
    pub fn new_buffer(
        blob_hash: &str,
        length: Option<u64>,
        is_mine: bool,
        on_completed: Option<CompletedCallback>,
    ) -> Result<Arc<Self>, BlobError> {
        if !is_valid_blobhash(blob_hash) {
            return Err(BlobError::InvalidBlobHash(blob_hash.to_string()));
        }
        Ok(Arc::new(Self {
            blob_hash: blob_hash.to_string(),
            added_on: now_timestamp(),
            is_mine,
            file_path: None,
            state: Mutex::new(BlobState {
                length,
                ..Default::default()
            }),
            verified: watch::channel(false).0,
            on_completed,
        }))
    }

    /// Creates a file-backed blob at `{blob_dir}/{blob_hash}`.
    ///
    /// If the file already exists with a size matching the expected
    /// length (or no length is known), the blob starts out verified. A
    /// conflicting file size deletes the file.
    pub fn new_file(
        blob_dir: &Path,
        blob_hash: &str,
        length: Option<u64>,
        is_mine: bool,
        on_completed: Option<CompletedCallback>,
    ) -> Result<Arc<Self>, BlobError> {
        if !is_valid_blobhash(blob_hash) {
            return Err(BlobError::InvalidBlobHash(blob_hash.to_string()));
        }
        if !blob_dir.is_dir() {
            return Err(BlobError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("invalid blob directory '{}'", blob_dir.display()),
            )));
        }
        let file_path = blob_dir.join(blob_hash);
        let mut state = BlobState {
            length,
            ..Default::default()
        };
        let mut verified = false;
        if let Ok(metadata) = std::fs::metadata(&file_path) {
            let file_size = metadata.len();
            match length {
                Some(expected) if expected != file_size => {
                    warn!(
                        "expected {blob_hash} to be {expected} bytes, file has {file_size}"
                    );
                    if let Err(err) = std::fs::remove_file(&file_path) {
                        warn!("failed to remove conflicting blob file: {err}");
                    }
                }
                _ => {
                    state.length = Some(file_size);
                    verified = true;
                }
            }
        }
        Ok(Arc::new(Self {
            blob_hash: blob_hash.to_string(),
            added_on: now_timestamp(),
            is_mine,
            file_path: Some(file_path),
            state: Mutex::new(state),
            verified: watch::channel(verified).0,
            on_completed,
        }))
    }

    pub fn blob_hash(&self) -> &str {
        &self.blob_hash
    }

    pub fn added_on(&self) -> u64 {
        self.added_on
    }

    pub fn is_mine(&self) -> bool {
        self.is_mine
    }

    pub fn is_buffer(&self) -> bool {
        self.file_path.is_none()
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    fn file_exists(&self) -> bool {
        self.file_path.as_ref().is_some_and(|path| path.is_file())
    }

    pub fn length(&self) -> Option<u64> {
        self.state.lock().unwrap().length
    }

    /// Accepts a length only if previously unknown and within bounds, or
    /// if it matches the known length.
    pub fn set_length(&self, length: u64) {
        let mut state = self.state.lock().unwrap();
        match state.length {
            Some(known) if known == length => {}
            None if length <= MAX_BLOB_SIZE => state.length = Some(length),
            previous => warn!(
                "got an invalid length. previous length: {previous:?}, invalid length: {length}"
            ),
        }
    }

    pub fn is_verified(&self) -> bool {
        *self.verified.borrow()
    }

    pub fn is_readable(&self) -> bool {
        self.is_verified()
    }

    pub fn is_writeable(&self) -> bool {
        !self.state.lock().unwrap().writing && !self.file_exists()
    }

    /// Resolves once the blob contents have been verified.
    pub async fn wait_verified(&self) {
        let mut rx = self.verified.subscribe();
        let _ = rx.wait_for(|verified| *verified).await;
    }

    /// Returns a fresh writer for bytes arriving from the given remote
    /// endpoint. Fails while a previous writer for the same endpoint is
    /// still open.
    pub fn get_blob_writer(
        self: &Arc<Self>,
        peer_address: Option<IpAddr>,
        peer_port: Option<u16>,
    ) -> Result<HashBlobWriter, BlobError> {
        if self.file_exists() {
            return Err(BlobError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("file already exists for {}", self.blob_hash),
            )));
        }
        let key = (peer_address, peer_port);
        let closed = Arc::new(AtomicBool::new(false));
        {
            let mut state = self.state.lock().unwrap();
            if let Some(existing) = state.writers.get(&key) {
                if !existing.closed.load(Ordering::SeqCst) {
                    return Err(BlobError::Io(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!(
                            "attempted to download blob twice from {peer_address:?}:{peer_port:?}"
                        ),
                    )));
                }
            }
            state.writers.insert(
                key,
                WriterEntry {
                    closed: closed.clone(),
                },
            );
        }
        let (finished_tx, finished_rx) = oneshot::channel::<Vec<u8>>();
        let blob = self.clone();
        tokio::spawn(async move {
            match finished_rx.await {
                Ok(verified_bytes) => {
                    // first writer to finish wins; every other writer
                    // for this blob becomes a no-op
                    blob.close_writers();
                    if let Err(err) = blob.save_verified_blob(&verified_bytes).await {
                        warn!(
                            "writer error downloading {}: {err}",
                            &blob.blob_hash[..8.min(blob.blob_hash.len())]
                        );
                    }
                }
                Err(_) => {
                    blob.remove_writer(&key);
                }
            }
        });
        Ok(HashBlobWriter::new(self.clone(), closed, finished_tx))
    }

    fn remove_writer(&self, key: &WriterKey) {
        self.state.lock().unwrap().writers.remove(key);
    }

    fn close_writers(&self) {
        let mut state = self.state.lock().unwrap();
        for (_, entry) in state.writers.drain() {
            entry.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Publishes verified bytes. A no-op if the blob is already verified
    /// or cannot currently be written.
    pub async fn save_verified_blob(self: &Arc<Self>, verified_bytes: &[u8]) -> Result<(), BlobError> {
        if self.is_verified() {
            return Ok(());
        }
        if !self.is_writeable() {
            debug!("{} is not writeable, skipping save", self.blob_hash);
            return Ok(());
        }
        {
            let mut state = self.state.lock().unwrap();
            state.writing = true;
            if state.length.is_none() {
                state.length = Some(verified_bytes.len() as u64);
            }
        }
        let result = self.write_verified_bytes(verified_bytes).await;
        self.state.lock().unwrap().writing = false;
        result?;
        self.verified.send_replace(true);
        if let Some(on_completed) = &self.on_completed {
            on_completed(self.clone());
        }
        Ok(())
    }

    async fn write_verified_bytes(&self, verified_bytes: &[u8]) -> Result<(), BlobError> {
        match &self.file_path {
            Some(path) => tokio::fs::write(path, verified_bytes)
                .await
                .map_err(BlobError::Io),
            None => {
                let mut state = self.state.lock().unwrap();
                if state.buffer.is_some() {
                    return Err(BlobError::Io(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "already have bytes for blob",
                    )));
                }
                state.buffer = Some(verified_bytes.to_vec());
                Ok(())
            }
        }
    }

    /// Opens the blob for reading. Fails unless verified.
    pub fn open_reader(self: &Arc<Self>) -> Result<BlobReadGuard, BlobError> {
        let mut state = self.state.lock().unwrap();
        if !self.is_readable() {
            return Err(BlobError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!(
                    "{} not readable, {} readers {} writers",
                    self.blob_hash,
                    state.readers,
                    state.writers.len()
                ),
            )));
        }
        let source = match &self.file_path {
            Some(path) => ReadSource::File(path.clone()),
            None => {
                let bytes = state.buffer.clone().ok_or_else(|| {
                    BlobError::Io(io::Error::new(
                        io::ErrorKind::NotFound,
                        "cannot open blob for reading",
                    ))
                })?;
                ReadSource::Buffer(bytes)
            }
        };
        state.readers += 1;
        Ok(BlobReadGuard {
            blob: self.clone(),
            source,
        })
    }

    /// Streams the blob to an external transport, returning the bytes
    /// sent.
    pub async fn sendfile<W: AsyncWrite + Unpin>(self: &Arc<Self>, writer: &mut W) -> Result<u64, BlobError> {
        let mut reader = self.open_reader()?;
        reader.copy_to(writer).await
    }

    /// Decrypts the blob contents to plaintext bytes with the supplied
    /// key and iv.
    pub async fn decrypt(self: &Arc<Self>, key: &[u8], iv: &[u8]) -> Result<Vec<u8>, BlobError> {
        let length = self.length().ok_or_else(|| {
            BlobError::InvalidData("cannot decrypt blob of unknown length".to_string())
        })?;
        let mut reader = self.open_reader()?;
        let data = reader.read_to_end().await?;
        decrypt_blob_bytes(&data, length, key, iv)
    }

    /// Closes all writers; their pending completions are cancelled.
    pub fn close(&self) {
        self.close_writers();
    }

    /// Removes backing bytes and resets the verified state.
    pub fn delete(&self) {
        self.close();
        {
            let mut state = self.state.lock().unwrap();
            state.buffer = None;
            state.length = None;
        }
        self.verified.send_replace(false);
        if let Some(path) = &self.file_path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!("failed to delete {}: {err}", self.blob_hash),
            }
        }
    }

    fn release_reader(&self, invalidate_buffer: bool) {
        let mut state = self.state.lock().unwrap();
        state.readers = state.readers.saturating_sub(1);
        if invalidate_buffer {
            state.buffer = None;
            drop(state);
            self.verified.send_replace(false);
        }
    }
}

enum ReadSource {
    File(PathBuf),
    Buffer(Vec<u8>),
}

/// An open reader. Buffer-backed blobs are single-use: releasing the
/// guard discards the buffer and clears the verified state.
pub struct BlobReadGuard {
    blob: Arc<Blob>,
    source: ReadSource,
}

impl BlobReadGuard {
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, BlobError> {
        match &self.source {
            ReadSource::File(path) => tokio::fs::read(path).await.map_err(BlobError::Io),
            ReadSource::Buffer(bytes) => Ok(bytes.clone()),
        }
    }

    pub async fn copy_to<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> Result<u64, BlobError> {
        match &self.source {
            ReadSource::File(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                let sent = tokio::io::copy(&mut file, writer).await?;
                writer.flush().await?;
                Ok(sent)
            }
            ReadSource::Buffer(bytes) => {
                writer.write_all(bytes).await?;
                writer.flush().await?;
                Ok(bytes.len() as u64)
            }
        }
    }
}

impl Drop for BlobReadGuard {
    fn drop(&mut self) {
        self.blob
            .release_reader(matches!(self.source, ReadSource::Buffer(_)));
    }
}
