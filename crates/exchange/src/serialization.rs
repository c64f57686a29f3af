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

//! Wire messages for the blob exchange protocol.
//!
//! A message is one UTF-8 JSON object whose top-level keys name the
//! bundled sub-messages; a response granting a download is immediately
//! followed by the raw blob bytes with no separator. Field names are
//! historical and kept for compatibility.

use nalu_common::error::BlobError;
use serde::{Deserialize, Serialize};

/// A standard bundled request is under 300 bytes; anything above this is
/// rejected outright.
pub const MAX_REQUEST_SIZE: usize = 1200;

/// Price acknowledgement values exchanged for `blob_data_payment_rate`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentRate {
    #[serde(rename = "RATE_ACCEPTED")]
    Accepted,
    #[serde(rename = "RATE_TOO_LOW")]
    TooLow,
    #[serde(rename = "RATE_UNSET")]
    Unset,
}

/// Bundled request sub-messages.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlobRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_blobs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_data_payment_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_blob: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lbrycrd_address: Option<bool>,
}

impl BlobRequest {
    /// The standard download bundle: availability + zero price + the
    /// blob itself.
    pub fn make_request_for_blob_hash(blob_hash: &str) -> Self {
        Self {
            requested_blobs: Some(vec![blob_hash.to_string()]),
            blob_data_payment_rate: Some(0.0),
            requested_blob: Some(blob_hash.to_string()),
            lbrycrd_address: Some(true),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("request serialization")
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, BlobError> {
        serde_json::from_slice(data)
            .map_err(|err| BlobError::InvalidData(format!("bad request: {err}")))
    }

    pub fn is_empty(&self) -> bool {
        self.requested_blobs.is_none()
            && self.blob_data_payment_rate.is_none()
            && self.requested_blob.is_none()
            && self.lbrycrd_address.is_none()
    }
}

/// The body of an `incoming_blob` response: either the granted blob or
/// a server-side error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IncomingBlob {
    Blob { blob_hash: String, length: u64 },
    Error { error: String },
}

/// Bundled response sub-messages.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlobResponseMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_blobs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_data_payment_rate: Option<PaymentRate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incoming_blob: Option<IncomingBlob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lbrycrd_address: Option<String>,
}

impl BlobResponseMessage {
    pub fn serialize(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("response serialization")
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

const RESPONSE_KEYS: [&str; 5] = [
    "available_blobs",
    "blob_data_payment_rate",
    "incoming_blob",
    "error",
    "lbrycrd_address",
];

/// A parsed response: the decoded message, if one has fully arrived,
/// and whatever trails it (the start of the blob payload).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BlobResponse {
    pub message: Option<BlobResponseMessage>,
    pub blob_data: Vec<u8>,
}

impl BlobResponse {
    /// Splits a buffer into `<json><blob bytes>`.
    ///
    /// Scans forward to each `}` and attempts to decode the prefix;
    /// the first decodable object whose keys are all recognized is the
    /// message, everything after it is raw payload. Buffers that do not
    /// (yet) contain a recognizable message come back unsplit.
    pub fn deserialize(data: &[u8]) -> Self {
        let mut curr = 0usize;
        loop {
            let Some(close) = data[curr..].iter().position(|&b| b == b'}') else {
                return Self {
                    message: None,
                    blob_data: data.to_vec(),
                };
            };
            curr += close + 1;
            let Ok(value) = serde_json::from_slice::<serde_json::Value>(&data[..curr]) else {
                continue;
            };
            let recognized = value.as_object().is_some_and(|object| {
                !object.is_empty() && object.keys().all(|key| RESPONSE_KEYS.contains(&key.as_str()))
            });
            if !recognized {
                return Self {
                    message: None,
                    blob_data: data.to_vec(),
                };
            }
            let Ok(message) = serde_json::from_value(value) else {
                return Self {
                    message: None,
                    blob_data: data.to_vec(),
                };
            };
            return Self {
                message: Some(message),
                blob_data: data[curr..].to_vec(),
            };
        }
    }
}
