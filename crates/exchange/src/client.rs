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

use crate::serialization::{BlobRequest, BlobResponse, BlobResponseMessage, IncomingBlob, PaymentRate};
use nalu_blob::blob::Blob;
use nalu_blob::connection::ConnectionManager;
use nalu_blob::writer::HashBlobWriter;
use nalu_common::error::BlobError;
use nalu_common::peer::Peer;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// What a blob request produced: bytes received, the connection if it is
/// still usable, and the failure if any.
pub struct RequestResult {
    pub bytes_received: u64,
    pub client: Option<BlobExchangeClient>,
    pub error: Option<BlobError>,
}

impl RequestResult {
    fn failed(bytes_received: u64, error: BlobError) -> Self {
        Self {
            bytes_received,
            client: None,
            error: Some(error),
        }
    }

    fn ok(bytes_received: u64, client: BlobExchangeClient) -> Self {
        Self {
            bytes_received,
            client: Some(client),
            error: None,
        }
    }
}

/// Protocol client for one peer connection; downloads one blob per call
/// and can be reused for the next request on the same connection.
pub struct BlobExchangeClient {
    stream: TcpStream,
    pub peer_address: IpAddr,
    pub peer_port: u16,
    peer_timeout: Duration,
    connection_manager: Option<Arc<ConnectionManager>>,
}

impl BlobExchangeClient {
    pub async fn connect(
        peer: &Peer,
        peer_connect_timeout: Duration,
        peer_timeout: Duration,
        connection_manager: Option<Arc<ConnectionManager>>,
    ) -> Result<Self, BlobError> {
        let stream = timeout(peer_connect_timeout, TcpStream::connect(peer.socket_addr()))
            .await
            .map_err(|_| BlobError::Timeout)??;
        if let Some(connection_manager) = &connection_manager {
            connection_manager.connection_made(&peer.to_string());
        }
        debug!("connection made to {peer}");
        Ok(Self {
            stream,
            peer_address: peer.address,
            peer_port: peer.tcp_port,
            peer_timeout,
            connection_manager,
        })
    }

    fn peer_key(&self) -> String {
        format!("{}:{}", self.peer_address, self.peer_port)
    }

    /// Requests one blob. Returns the bytes received and, when the
    /// transfer (or the no-op) left the connection healthy, the client
    /// for reuse.
    pub async fn download_blob(mut self, blob: &Arc<Blob>) -> RequestResult {
        if blob.is_verified() || !blob.is_writeable() {
            return RequestResult::ok(0, self);
        }
        let mut writer =
            match blob.get_blob_writer(Some(self.peer_address), Some(self.peer_port)) {
                Ok(writer) => writer,
                Err(err) => {
                    // raced another writer for this endpoint
                    warn!(
                        "race happened downloading {} from {}: {err}",
                        blob.blob_hash(),
                        self.peer_key()
                    );
                    return RequestResult::failed(0, err);
                }
            };
        let mut bytes_received = 0u64;
        match self.download_into(blob, &mut writer, &mut bytes_received).await {
            Ok(()) => RequestResult::ok(bytes_received, self),
            Err(err) => {
                match &err {
                    BlobError::Timeout => {
                        debug!("timed out downloading from {}", self.peer_key())
                    }
                    BlobError::InvalidBlobHash(_) | BlobError::InvalidData(_) => {
                        warn!("invalid blob from {}", self.peer_key())
                    }
                    other => debug!("download from {} failed: {other}", self.peer_key()),
                }
                writer.close_handle();
                if let Some(connection_manager) = &self.connection_manager {
                    connection_manager.outgoing_connection_lost(&self.peer_key());
                }
                RequestResult::failed(bytes_received, err)
            }
        }
    }

    async fn download_into(
        &mut self,
        blob: &Arc<Blob>,
        writer: &mut HashBlobWriter,
        bytes_received: &mut u64,
    ) -> Result<(), BlobError> {
        let started = Instant::now();
        let request = BlobRequest::make_request_for_blob_hash(blob.blob_hash());
        let message = request.serialize();
        debug!(
            "send request to {} -> {}",
            self.peer_key(),
            String::from_utf8_lossy(&message)
        );
        self.stream.write_all(&message).await?;
        if let Some(connection_manager) = &self.connection_manager {
            connection_manager.sent_data(&self.peer_key(), message.len() as u64);
        }

        let (response, first_payload) = self.read_response().await?;
        self.validate_response(blob, &response)?;

        self.write_chunk(blob, writer, &first_payload, bytes_received)?;
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        while !writer.finished() {
            let n = timeout(self.peer_timeout, self.stream.read(&mut chunk))
                .await
                .map_err(|_| BlobError::Timeout)??;
            if n == 0 {
                return Err(BlobError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed during transfer",
                )));
            }
            if let Some(connection_manager) = &self.connection_manager {
                connection_manager.received_data(&self.peer_key(), n as u64);
            }
            self.write_chunk(blob, writer, &chunk[..n], bytes_received)?;
        }

        // wait for the io to finish
        timeout(self.peer_timeout, blob.wait_verified())
            .await
            .map_err(|_| BlobError::Timeout)?;
        let elapsed = started.elapsed().as_secs_f64();
        info!(
            "downloaded {} from {} at {:.2}MB/s",
            &blob.blob_hash()[..8],
            self.peer_key(),
            if elapsed > 0.0 {
                (*bytes_received as f64 / elapsed) / 1_000_000.0
            } else {
                0.0
            }
        );
        Ok(())
    }

    /// Reads until a recognizable response object arrives; returns it
    /// with whatever payload bytes trail it.
    async fn read_response(&mut self) -> Result<(BlobResponseMessage, Vec<u8>), BlobError> {
        let deadline = self.peer_timeout;
        let stream = &mut self.stream;
        let connection_manager = self.connection_manager.clone();
        let peer_key = format!("{}:{}", self.peer_address, self.peer_port);
        timeout(deadline, async move {
            let mut buf = Vec::new();
            let mut chunk = vec![0u8; READ_CHUNK_SIZE];
            loop {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(BlobError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before a response",
                    )));
                }
                if let Some(connection_manager) = &connection_manager {
                    connection_manager.received_data(&peer_key, n as u64);
                }
                buf.extend_from_slice(&chunk[..n]);
                let response = BlobResponse::deserialize(&buf);
                if let Some(message) = response.message {
                    debug!("got response from {peer_key} <- {message:?}");
                    return Ok((message, response.blob_data));
                }
            }
        })
        .await
        .map_err(|_| BlobError::Timeout)?
    }

    fn validate_response(
        &self,
        blob: &Arc<Blob>,
        response: &BlobResponseMessage,
    ) -> Result<(), BlobError> {
        let blob_response = match &response.incoming_blob {
            Some(IncomingBlob::Blob { blob_hash, length }) => {
                if blob_hash != blob.blob_hash() {
                    warn!(
                        "{} started sending blob we didn't request {} instead of {}",
                        self.peer_key(),
                        blob_hash,
                        blob.blob_hash()
                    );
                    return Err(BlobError::InvalidData(
                        "incoming blob hash mismatch".to_string(),
                    ));
                }
                Some(*length)
            }
            Some(IncomingBlob::Error { error }) => {
                debug!("server error from {}: {error}", self.peer_key());
                None
            }
            None => None,
        };
        let available = response.available_blobs.as_deref();
        match available {
            None => {
                warn!(
                    "response from {} did not include an availability response",
                    self.peer_key()
                );
                return Err(BlobError::InvalidData(
                    "missing availability response".to_string(),
                ));
            }
            Some([]) => {
                warn!(
                    "{} not in availability response from {}",
                    blob.blob_hash(),
                    self.peer_key()
                );
                return Err(BlobError::InvalidData("blob is not available".to_string()));
            }
            Some(blobs) if blobs.len() != 1 || blobs[0] != blob.blob_hash() => {
                warn!(
                    "blob availability response doesn't match our request from {}",
                    self.peer_key()
                );
                return Err(BlobError::InvalidData(
                    "availability response mismatch".to_string(),
                ));
            }
            Some(_) => {}
        }
        if response.blob_data_payment_rate != Some(PaymentRate::Accepted) {
            warn!("data rate rejected by {}", self.peer_key());
            return Err(BlobError::InvalidData("data rate rejected".to_string()));
        }
        let Some(length) = blob_response else {
            warn!("blob can't be downloaded from {}", self.peer_key());
            return Err(BlobError::InvalidData("blob was not granted".to_string()));
        };
        blob.set_length(length);
        if blob.length() != Some(length) {
            warn!("incoming blob unexpected length from {}", self.peer_key());
            return Err(BlobError::InvalidData(
                "incoming blob unexpected length".to_string(),
            ));
        }
        Ok(())
    }

    /// Feeds a payload chunk to the writer, truncating bytes past the
    /// declared length.
    fn write_chunk(
        &self,
        blob: &Arc<Blob>,
        writer: &mut HashBlobWriter,
        data: &[u8],
        bytes_received: &mut u64,
    ) -> Result<(), BlobError> {
        if data.is_empty() {
            return Ok(());
        }
        let remaining = blob
            .length()
            .unwrap_or_default()
            .saturating_sub(*bytes_received) as usize;
        let data = if data.len() > remaining {
            warn!(
                "got more than asked from {}, probable sendfile bug",
                self.peer_key()
            );
            &data[..remaining]
        } else {
            data
        };
        *bytes_received += data.len() as u64;
        writer.write(data)
    }
}

/// Requests `blob` from a peer, reusing `connected` when it is still
/// healthy and opening a fresh connection otherwise. A `None` blob is a
/// pure connection probe.
pub async fn request_blob(
    blob: Option<&Arc<Blob>>,
    peer: &Peer,
    peer_connect_timeout: Duration,
    blob_download_timeout: Duration,
    connected: Option<BlobExchangeClient>,
    connection_manager: Option<Arc<ConnectionManager>>,
) -> RequestResult {
    let client = match connected {
        Some(client) => {
            debug!("reusing connection for {peer}");
            client
        }
        None => {
            match BlobExchangeClient::connect(
                peer,
                peer_connect_timeout,
                blob_download_timeout,
                connection_manager,
            )
            .await
            {
                Ok(client) => client,
                Err(err) => {
                    debug!("could not connect to {peer}: {err}");
                    return RequestResult::failed(0, err);
                }
            }
        }
    };
    let Some(blob) = blob else {
        return RequestResult::ok(0, client);
    };
    if blob.is_verified() || !blob.is_writeable() {
        // someone is writing right now, give it time, come back later
        return RequestResult::ok(0, client);
    }
    client.download_blob(blob).await
}
