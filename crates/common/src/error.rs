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

/// Error taxonomy for blob storage and exchange.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// Syntactically invalid blob hash, or a digest mismatch at the end
    /// of a write.
    #[error("InvalidBlobHash error: {0}")]
    InvalidBlobHash(String),

    /// Malformed protocol data.
    #[error("InvalidData error: {0}")]
    InvalidData(String),

    /// A writer received more bytes than the expected blob length.
    #[error("BlobTooBig error: received {received} of {expected} expected bytes")]
    BlobTooBig { expected: u64, received: u64 },

    /// Consumer-initiated cancellation during a transfer.
    #[error("DownloadCancelled error")]
    DownloadCancelled,

    /// Structural failure of a stream descriptor blob.
    #[error("InvalidStreamDescriptor error: {0}")]
    InvalidStreamDescriptor(String),

    /// A deadline elapsed while waiting on a peer or on local io.
    #[error("Timeout error")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BlobError {
    /// Whether this failure is attributable to the remote peer's data
    /// rather than to the transport.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            BlobError::InvalidBlobHash(_) | BlobError::InvalidData(_) | BlobError::BlobTooBig { .. }
        )
    }
}
