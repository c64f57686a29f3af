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

//! End-to-end exchange protocol scenarios over loopback TCP.

use nalu_blob::index::MemoryBlobIndex;
use nalu_blob::BlobManager;
use nalu_common::conf::Config;
use nalu_common::error::BlobError;
use nalu_common::hash::hash_blob_bytes;
use nalu_common::peer::Peer;
use nalu_exchange::serialization::{BlobResponseMessage, IncomingBlob, PaymentRate};
use nalu_exchange::{request_blob, BlobDownloader, BlobServer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

fn test_config(blob_dir: &std::path::Path, save_blobs: bool) -> Config {
    Config {
        blob_dir: blob_dir.to_path_buf(),
        save_blobs,
        track_bandwidth: false,
        peer_connect_timeout: 0.5,
        blob_download_timeout: 2.0,
        idle_timeout: 0.2,
        transfer_timeout: 2.0,
        fixed_peer_delay: 0.1,
        ..Default::default()
    }
}

fn make_manager(save_blobs: bool) -> (TempDir, Arc<BlobManager>) {
    let dir = tempdir().unwrap();
    let manager = BlobManager::new(
        test_config(dir.path(), save_blobs),
        Arc::new(MemoryBlobIndex::new()),
    );
    (dir, manager)
}

async fn seed_blob(manager: &Arc<BlobManager>, bytes: &[u8]) -> String {
    let blob_hash = hash_blob_bytes(bytes);
    let blob = manager
        .get_blob(&blob_hash, Some(bytes.len() as u64), true)
        .await
        .unwrap();
    let mut writer = blob.get_blob_writer(None, None).unwrap();
    writer.write(bytes).unwrap();
    blob.wait_verified().await;
    // completion dispatch lands on a spawned task
    for _ in 0..100 {
        if manager.is_blob_completed(&blob_hash) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(manager.is_blob_completed(&blob_hash));
    blob_hash
}

async fn start_server(manager: &Arc<BlobManager>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(BlobServer::new(manager.clone(), None));
    tokio::spawn(server.start(listener));
    addr
}

/// A server that reads one request and replies with arbitrary bytes.
async fn start_one_shot_server(reply: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = vec![0u8; 2048];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(&reply).await;
            let _ = stream.shutdown().await;
        }
    });
    addr
}

fn granted_response_header(blob_hash: &str, length: u64) -> Vec<u8> {
    BlobResponseMessage {
        available_blobs: Some(vec![blob_hash.to_string()]),
        blob_data_payment_rate: Some(PaymentRate::Accepted),
        incoming_blob: Some(IncomingBlob::Blob {
            blob_hash: blob_hash.to_string(),
            length,
        }),
        ..Default::default()
    }
    .serialize()
}

#[tokio::test]
async fn test_client_downloads_and_verifies_a_blob() {
    let (_server_dir, server_manager) = make_manager(true);
    let bytes = b"exchange me over loopback".to_vec();
    let blob_hash = seed_blob(&server_manager, &bytes).await;
    let addr = start_server(&server_manager).await;

    let (_client_dir, client_manager) = make_manager(false);
    let blob = client_manager
        .get_blob(&blob_hash, None, false)
        .await
        .unwrap();
    let peer = Peer::from(addr);
    let result = request_blob(
        Some(&blob),
        &peer,
        Duration::from_millis(500),
        Duration::from_secs(2),
        None,
        None,
    )
    .await;
    assert!(result.error.is_none(), "{:?}", result.error);
    assert!(result.client.is_some());
    assert_eq!(result.bytes_received, bytes.len() as u64);
    assert!(blob.is_verified());
    let read_back = blob.open_reader().unwrap().read_to_end().await.unwrap();
    assert_eq!(read_back, bytes);
}

#[tokio::test]
async fn test_connection_reuse_across_blobs() {
    let (_server_dir, server_manager) = make_manager(true);
    let first_bytes = b"first blob".to_vec();
    let second_bytes = b"second blob".to_vec();
    let first_hash = seed_blob(&server_manager, &first_bytes).await;
    let second_hash = seed_blob(&server_manager, &second_bytes).await;
    let addr = start_server(&server_manager).await;
    let peer = Peer::from(addr);

    let (_client_dir, client_manager) = make_manager(false);
    let first = client_manager.get_blob(&first_hash, None, false).await.unwrap();
    let result = request_blob(
        Some(&first),
        &peer,
        Duration::from_millis(500),
        Duration::from_secs(2),
        None,
        None,
    )
    .await;
    assert!(first.is_verified());
    let client = result.client.expect("healthy connection");

    // the same TCP connection serves the next request
    let second = client_manager
        .get_blob(&second_hash, None, false)
        .await
        .unwrap();
    let result = request_blob(
        Some(&second),
        &peer,
        Duration::from_millis(500),
        Duration::from_secs(2),
        Some(client),
        None,
    )
    .await;
    assert!(result.error.is_none(), "{:?}", result.error);
    assert!(second.is_verified());
}

#[tokio::test]
async fn test_truncated_transfer_leaves_blob_unverified() {
    let bytes = b"this transfer will be cut short".to_vec();
    let blob_hash = hash_blob_bytes(&bytes);
    let mut reply = granted_response_header(&blob_hash, bytes.len() as u64);
    reply.extend_from_slice(&bytes[..bytes.len() - 1]);
    let addr = start_one_shot_server(reply).await;

    let (_client_dir, client_manager) = make_manager(false);
    let blob = client_manager.get_blob(&blob_hash, None, false).await.unwrap();
    let result = request_blob(
        Some(&blob),
        &Peer::from(addr),
        Duration::from_millis(500),
        Duration::from_secs(2),
        None,
        None,
    )
    .await;
    assert_eq!(result.bytes_received, bytes.len() as u64 - 1);
    assert!(result.client.is_none());
    assert!(result.error.is_some());
    assert!(!blob.is_verified());

    // a healthy peer completes the same blob afterwards
    let (_server_dir, server_manager) = make_manager(true);
    seed_blob(&server_manager, &bytes).await;
    let healthy = start_server(&server_manager).await;
    let result = request_blob(
        Some(&blob),
        &Peer::from(healthy),
        Duration::from_millis(500),
        Duration::from_secs(2),
        None,
        None,
    )
    .await;
    assert!(result.error.is_none(), "{:?}", result.error);
    assert!(blob.is_verified());
}

#[tokio::test]
async fn test_corrupt_bytes_fail_verification() {
    let bytes = b"the bytes the hash was made from".to_vec();
    let blob_hash = hash_blob_bytes(&bytes);
    let mut corrupted = bytes.clone();
    corrupted[0] ^= 0xff;
    let mut reply = granted_response_header(&blob_hash, bytes.len() as u64);
    reply.extend_from_slice(&corrupted);
    let addr = start_one_shot_server(reply).await;

    let (_client_dir, client_manager) = make_manager(false);
    let blob = client_manager.get_blob(&blob_hash, None, false).await.unwrap();
    let result = request_blob(
        Some(&blob),
        &Peer::from(addr),
        Duration::from_millis(500),
        Duration::from_secs(2),
        None,
        None,
    )
    .await;
    assert!(result.client.is_none());
    assert!(matches!(result.error, Some(BlobError::InvalidBlobHash(_))));
    assert!(!blob.is_verified());
}

#[tokio::test]
async fn test_excess_bytes_are_truncated() {
    let bytes = b"exactly these bytes".to_vec();
    let blob_hash = hash_blob_bytes(&bytes);
    let mut reply = granted_response_header(&blob_hash, bytes.len() as u64);
    reply.extend_from_slice(&bytes);
    // a server-side off-by-one appends garbage past the declared length
    reply.extend_from_slice(b"\n");
    let addr = start_one_shot_server(reply).await;

    let (_client_dir, client_manager) = make_manager(false);
    let blob = client_manager.get_blob(&blob_hash, None, false).await.unwrap();
    let result = request_blob(
        Some(&blob),
        &Peer::from(addr),
        Duration::from_millis(500),
        Duration::from_secs(2),
        None,
        None,
    )
    .await;
    assert!(result.error.is_none(), "{:?}", result.error);
    assert_eq!(result.bytes_received, bytes.len() as u64);
    assert!(blob.is_verified());
}

#[tokio::test]
async fn test_rejected_rate_refuses_download() {
    let bytes = b"priced out".to_vec();
    let blob_hash = hash_blob_bytes(&bytes);
    let mut reply = granted_response_header(&blob_hash, bytes.len() as u64);
    // overwrite the rate acknowledgement with a refusal
    reply = {
        let mut message: BlobResponseMessage = serde_json::from_slice(&reply).unwrap();
        message.blob_data_payment_rate = Some(PaymentRate::TooLow);
        message.serialize()
    };
    let addr = start_one_shot_server(reply).await;

    let (_client_dir, client_manager) = make_manager(false);
    let blob = client_manager.get_blob(&blob_hash, None, false).await.unwrap();
    let result = request_blob(
        Some(&blob),
        &Peer::from(addr),
        Duration::from_millis(500),
        Duration::from_secs(2),
        None,
        None,
    )
    .await;
    assert!(result.client.is_none());
    assert!(matches!(result.error, Some(BlobError::InvalidData(_))));
    assert!(!blob.is_verified());
}

#[tokio::test]
async fn test_downloader_benches_dead_peer_then_scores_live_one() {
    let bytes = b"raced between two peers".to_vec();
    let blob_hash = hash_blob_bytes(&bytes);

    // a peer that refuses connections
    let dead_addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
        // listener dropped here
    };
    let dead_peer = Peer::from(dead_addr);

    let (_client_dir, client_manager) = make_manager(false);
    let mut downloader = BlobDownloader::new(client_manager.clone());
    downloader.peer_sender().send(vec![dead_peer.clone()]).unwrap();
    let raced = timeout(
        Duration::from_millis(1500),
        downloader.download_blob(&blob_hash, Some(bytes.len() as u64)),
    )
    .await;
    assert!(raced.is_err(), "download cannot finish with a dead peer");
    assert!(downloader.failure_count(&dead_peer) >= 1);
    assert!(downloader.is_ignored(&dead_peer));

    // the live peer wins the next round
    let (_server_dir, server_manager) = make_manager(true);
    seed_blob(&server_manager, &bytes).await;
    let live_addr = start_server(&server_manager).await;
    let live_peer = Peer::from(live_addr);
    downloader.peer_sender().send(vec![live_peer.clone()]).unwrap();
    let blob = timeout(
        Duration::from_secs(5),
        downloader.download_blob(&blob_hash, Some(bytes.len() as u64)),
    )
    .await
    .expect("a live peer serves the blob")
    .unwrap();
    assert!(blob.is_verified());
    assert!(downloader.peer_score(&live_peer).unwrap_or_default() > 0.0);
    downloader.close();
}

#[tokio::test]
async fn test_downloader_race_publishes_once() {
    let bytes = b"two servers, one winner".to_vec();
    let blob_hash = hash_blob_bytes(&bytes);
    let (_dir_a, manager_a) = make_manager(true);
    let (_dir_b, manager_b) = make_manager(true);
    seed_blob(&manager_a, &bytes).await;
    seed_blob(&manager_b, &bytes).await;
    let peer_a = Peer::from(start_server(&manager_a).await);
    let peer_b = Peer::from(start_server(&manager_b).await);

    let (_client_dir, client_manager) = make_manager(false);
    let mut downloader = BlobDownloader::new(client_manager.clone());
    downloader
        .peer_sender()
        .send(vec![peer_a.clone(), peer_b.clone()])
        .unwrap();
    let blob = timeout(
        Duration::from_secs(5),
        downloader.download_blob(&blob_hash, Some(bytes.len() as u64)),
    )
    .await
    .expect("race completes")
    .unwrap();
    assert!(blob.is_verified());
    let read_back = blob.open_reader().unwrap().read_to_end().await.unwrap();
    assert_eq!(read_back, bytes);
    downloader.close();
}

#[tokio::test]
async fn test_fixed_peers_join_the_race_after_the_delay() {
    let bytes = b"fixed peer to the rescue".to_vec();
    let blob_hash = hash_blob_bytes(&bytes);
    let (_server_dir, server_manager) = make_manager(true);
    seed_blob(&server_manager, &bytes).await;
    let addr = start_server(&server_manager).await;

    let (_client_dir, client_manager) = make_manager(false);
    let mut downloader = BlobDownloader::new(client_manager.clone());
    downloader.add_fixed_peers(vec![Peer::from(addr)], true);
    let blob = timeout(
        Duration::from_secs(5),
        downloader.download_blob(&blob_hash, Some(bytes.len() as u64)),
    )
    .await
    .expect("fixed peer serves the blob")
    .unwrap();
    assert!(blob.is_verified());
    downloader.close();
}

#[tokio::test]
async fn test_server_closes_idle_connections() {
    let (_server_dir, server_manager) = make_manager(true);
    let addr = start_server(&server_manager).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // send nothing; the server applies its idle timeout
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("server should hang up")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_server_closes_on_oversized_request() {
    let (_server_dir, server_manager) = make_manager(true);
    let addr = start_server(&server_manager).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&vec![b'x'; 1300]).await.unwrap();
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("server should hang up")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_server_availability_only_when_blob_absent() {
    let (_server_dir, server_manager) = make_manager(true);
    let addr = start_server(&server_manager).await;
    let absent_hash = hash_blob_bytes(b"not hosted here");

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = nalu_exchange::serialization::BlobRequest::make_request_for_blob_hash(&absent_hash);
    stream.write_all(&request.serialize()).await.unwrap();
    let mut buf = vec![0u8; 2048];
    let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("response expected")
        .unwrap();
    let message: BlobResponseMessage = serde_json::from_slice(&buf[..n]).unwrap();
    assert_eq!(message.available_blobs.as_deref(), Some(&[][..]));
    assert_eq!(message.blob_data_payment_rate, Some(PaymentRate::Accepted));
    assert!(message.incoming_blob.is_none());
}
