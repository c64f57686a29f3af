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

use crate::blob::Blob;
use nalu_common::error::BlobError;
use nalu_common::hash::blob_hasher;
use sha2::{Digest, Sha384};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Streams untrusted bytes into a running digest and length counter.
///
/// The writer completes exactly once: when the accumulated bytes reach
/// the expected blob length and their digest matches the blob hash, the
/// bytes are handed to the blob for publication. Closing the writer
/// abandons the completion.
pub struct HashBlobWriter {
    blob: Arc<Blob>,
    closed: Arc<AtomicBool>,
    hasher: Sha384,
    buffer: Vec<u8>,
    len_so_far: u64,
    finished: bool,
    finished_tx: Option<oneshot::Sender<Vec<u8>>>,
}

impl HashBlobWriter {
    pub(crate) fn new(
        blob: Arc<Blob>,
        closed: Arc<AtomicBool>,
        finished_tx: oneshot::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            blob,
            closed,
            hasher: blob_hasher(),
            buffer: Vec::new(),
            len_so_far: 0,
            finished: false,
            finished_tx: Some(finished_tx),
        }
    }

    /// Appends a chunk of bytes. Fails if the chunk would overrun the
    /// expected length, or if the digest does not match the blob hash
    /// once the final byte arrives. Writes after close are dropped.
    pub fn write(&mut self, data: &[u8]) -> Result<(), BlobError> {
        if self.closed() {
            debug!("writer has already been closed");
            return Ok(());
        }
        let expected_length = self.blob.length().ok_or_else(|| {
            BlobError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot write blob when length is not known",
            ))
        })?;
        self.hasher.update(data);
        self.len_so_far += data.len() as u64;
        if self.len_so_far > expected_length {
            self.close_handle();
            return Err(BlobError::BlobTooBig {
                expected: expected_length,
                received: self.len_so_far,
            });
        }
        self.buffer.extend_from_slice(data);
        if self.len_so_far == expected_length {
            let digest = hex::encode(self.hasher.finalize_reset());
            if digest != self.blob.blob_hash() {
                self.close_handle();
                return Err(BlobError::InvalidBlobHash(format!(
                    "digest {} does not match expected {}",
                    &digest[..8],
                    &self.blob.blob_hash()[..8]
                )));
            }
            let verified_bytes = std::mem::take(&mut self.buffer);
            self.closed.store(true, Ordering::SeqCst);
            self.finished = true;
            if let Some(tx) = self.finished_tx.take() {
                let _ = tx.send(verified_bytes);
            }
        }
        Ok(())
    }

    /// Abandons the writer; safe to call repeatedly. A closed writer's
    /// completion is never fulfilled.
    pub fn close_handle(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        // dropping the sender cancels the pending completion
        self.finished_tx.take();
        self.buffer.clear();
    }

    /// Whether the writer can no longer accept bytes.
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether the writer completed with verified bytes.
    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn len_so_far(&self) -> u64 {
        self.len_so_far
    }
}

impl Drop for HashBlobWriter {
    fn drop(&mut self) {
        if !self.closed() {
            self.close_handle();
        }
    }
}
