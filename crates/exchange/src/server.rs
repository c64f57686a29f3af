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

use crate::serialization::{
    BlobRequest, BlobResponseMessage, IncomingBlob, PaymentRate, MAX_REQUEST_SIZE,
};
use itertools::Itertools;
use nalu_blob::BlobManager;
use nalu_common::error::BlobError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Serves blob availability and blob bytes to inbound peers.
///
/// Each connection runs a sequential request loop: the idle timeout
/// applies while waiting for a request and is suspended during a
/// transfer, which is bounded by its own timeout instead. Any parse
/// error, transport error, or timeout closes the connection.
pub struct BlobServer {
    manager: Arc<BlobManager>,
    payment_address: Option<String>,
    pub idle_timeout: Duration,
    pub transfer_timeout: Duration,
}

impl BlobServer {
    pub fn new(manager: Arc<BlobManager>, payment_address: Option<String>) -> Self {
        let idle_timeout = manager.config().idle_timeout();
        let transfer_timeout = manager.config().transfer_timeout();
        Self {
            manager,
            payment_address,
            idle_timeout,
            transfer_timeout,
        }
    }

    /// Accepts connections until the task is dropped or the listener
    /// fails.
    pub async fn start(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("blob server listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("received connection from {addr}");
            let server = self.clone();
            tokio::spawn(async move {
                let peer_key = addr.to_string();
                server
                    .manager
                    .connection_manager()
                    .connection_received(&peer_key);
                if let Err(err) = server.handle_connection(stream, addr).await {
                    debug!("connection from {addr} closed: {err}");
                }
                server
                    .manager
                    .connection_manager()
                    .incoming_connection_lost(&peer_key);
            });
        }
    }

    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), BlobError> {
        let peer_key = addr.to_string();
        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = vec![0u8; MAX_REQUEST_SIZE];
        loop {
            let request = loop {
                let read = timeout(self.idle_timeout, stream.read(&mut chunk)).await;
                let n = match read {
                    Err(_) => {
                        debug!("closing idle connection from {peer_key}");
                        return Ok(());
                    }
                    Ok(Ok(0)) => return Ok(()),
                    Ok(Ok(n)) => n,
                    Ok(Err(err)) => return Err(err.into()),
                };
                self.manager
                    .connection_manager()
                    .received_data(&peer_key, n as u64);
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() >= MAX_REQUEST_SIZE {
                    warn!("request from {peer_key} is too large");
                    return Ok(());
                }
                let Some(close) = buf.iter().rposition(|&b| b == b'}') else {
                    continue;
                };
                match BlobRequest::deserialize(&buf[..=close]) {
                    Ok(request) if !request.is_empty() => {
                        buf.drain(..=close);
                        break request;
                    }
                    Ok(_) => {
                        warn!(
                            "failed to decode request from {peer_key} ({} bytes): {}",
                            buf.len(),
                            hex::encode(&buf)
                        );
                        return Ok(());
                    }
                    Err(_) => {
                        warn!(
                            "request from {peer_key} is not valid json ({} bytes): {}",
                            buf.len(),
                            hex::encode(&buf)
                        );
                        return Ok(());
                    }
                }
            };
            self.handle_request(&request, &mut stream, addr).await?;
        }
    }

    async fn handle_request(
        &self,
        request: &BlobRequest,
        stream: &mut TcpStream,
        addr: SocketAddr,
    ) -> Result<(), BlobError> {
        let peer_key = addr.to_string();
        let mut response = BlobResponseMessage::default();
        if request.lbrycrd_address.is_some() {
            response.lbrycrd_address =
                Some(self.payment_address.clone().unwrap_or_default());
        }
        if let Some(requested_blobs) = &request.requested_blobs {
            response.available_blobs = Some(
                requested_blobs
                    .iter()
                    .filter(|blob_hash| self.manager.is_blob_completed(blob_hash))
                    .unique()
                    .cloned()
                    .collect(),
            );
        }
        if request.blob_data_payment_rate.is_some() {
            response.blob_data_payment_rate = Some(PaymentRate::Accepted);
        }

        if let Some(requested_blob) = &request.requested_blob {
            let blob = self.manager.get_blob(requested_blob, None, false).await?;
            if blob.is_verified() {
                response.incoming_blob = Some(IncomingBlob::Blob {
                    blob_hash: blob.blob_hash().to_string(),
                    length: blob.length().unwrap_or_default(),
                });
                self.send_response(&response, stream, &peer_key).await?;
                let short_hash = &blob.blob_hash()[..8];
                debug!("send {short_hash} to {peer_key}");
                match timeout(self.transfer_timeout, blob.sendfile(stream)).await {
                    Ok(Ok(sent)) if sent > 0 => {
                        self.manager
                            .connection_manager()
                            .sent_data(&peer_key, sent);
                        info!("sent {short_hash} ({sent} bytes) to {peer_key}");
                        return Ok(());
                    }
                    Ok(Ok(_)) => {
                        debug!("stopped sending {short_hash} to {peer_key}");
                        return Err(BlobError::Io(std::io::Error::new(
                            std::io::ErrorKind::WriteZero,
                            "transfer stopped",
                        )));
                    }
                    Ok(Err(err)) => {
                        warn!("could not read blob {short_hash} to send {peer_key}");
                        return Err(err);
                    }
                    Err(_) => {
                        debug!("timed out sending blob {short_hash} to {peer_key}");
                        return Err(BlobError::Timeout);
                    }
                }
            }
            info!(
                "don't have {} to send {peer_key}",
                &blob.blob_hash()[..8]
            );
        }
        if !response.is_empty() {
            self.send_response(&response, stream, &peer_key).await?;
        }
        Ok(())
    }

    async fn send_response(
        &self,
        response: &BlobResponseMessage,
        stream: &mut TcpStream,
        peer_key: &str,
    ) -> Result<(), BlobError> {
        use tokio::io::AsyncWriteExt;
        let serialized = response.serialize();
        stream.write_all(&serialized).await?;
        self.manager
            .connection_manager()
            .sent_data(peer_key, serialized.len() as u64);
        Ok(())
    }
}
