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

pub mod descriptor;

pub use descriptor::{sanitize_file_name, BlobInfo, StreamDescriptor, DEFAULT_FILE_NAME};

use nalu_blob::cipher::{encrypt_blob_bytes, AES_BLOCK_SIZE, KEY_SIZE};
use nalu_blob::BlobManager;
use nalu_common::error::BlobError;
use nalu_common::hash::MAX_BLOB_SIZE;
use nalu_common::utils::now_timestamp;
use rand::RngCore;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

/// Produces a fresh random IV per call.
pub fn random_iv_generator() -> impl FnMut() -> [u8; AES_BLOCK_SIZE] + Send {
    || {
        let mut iv = [0u8; AES_BLOCK_SIZE];
        rand::rng().fill_bytes(&mut iv);
        iv
    }
}

fn random_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Encrypts one plaintext chunk, stores the ciphertext as a verified
/// blob, and returns its place in the stream.
pub async fn create_from_unencrypted(
    manager: &Arc<BlobManager>,
    key: &[u8],
    iv: [u8; AES_BLOCK_SIZE],
    unencrypted: &[u8],
    blob_num: u32,
    added_on: u64,
    is_mine: bool,
) -> Result<BlobInfo, BlobError> {
    let (blob_bytes, blob_hash) = encrypt_blob_bytes(key, &iv, unencrypted)?;
    let length = blob_bytes.len() as u64;
    let blob = manager.get_blob(&blob_hash, Some(length), is_mine).await?;
    if !blob.is_verified() {
        let mut writer = blob.get_blob_writer(None, None)?;
        writer.write(&blob_bytes)?;
    }
    blob.wait_verified().await;
    blob.close();
    Ok(BlobInfo::new(
        blob_num,
        length,
        hex::encode(iv),
        added_on,
        Some(blob_hash),
        is_mine,
    ))
}

async fn read_chunk(file_path: &Path, offset: u64, to_read: u64) -> Result<Vec<u8>, BlobError> {
    let file_path = file_path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let mut file = std::fs::File::open(file_path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut chunk = vec![0u8; to_read as usize];
        file.read_exact(&mut chunk)?;
        Ok(chunk)
    })
    .await
    .map_err(|err| BlobError::Io(std::io::Error::other(err)))?
    .map_err(BlobError::Io)
}

/// Chunks `file_path` into encrypted blobs and assembles a verified
/// stream descriptor over them.
///
/// Plaintext segments are at most one byte short of the blob ceiling so
/// that PKCS7 padding never overflows a blob. A random key is generated
/// when none is supplied; every blob gets a fresh IV.
pub async fn create_stream(
    manager: &Arc<BlobManager>,
    file_path: &Path,
    key: Option<[u8; KEY_SIZE]>,
    iv_generator: Option<Box<dyn FnMut() -> [u8; AES_BLOCK_SIZE] + Send>>,
    old_sort: bool,
) -> Result<StreamDescriptor, BlobError> {
    let mut iv_generator = iv_generator.unwrap_or_else(|| Box::new(random_iv_generator()));
    let key = key.unwrap_or_else(random_key);
    let added_on = now_timestamp();

    let file_length = tokio::fs::metadata(file_path).await?.len();
    let mut blobs: Vec<BlobInfo> = Vec::new();
    let mut offset = 0u64;
    while offset < file_length {
        let to_read = (file_length - offset).min(MAX_BLOB_SIZE - 1);
        let chunk = read_chunk(file_path, offset, to_read).await?;
        let blob_info = create_from_unencrypted(
            manager,
            &key,
            iv_generator(),
            &chunk,
            blobs.len() as u32,
            added_on,
            true,
        )
        .await?;
        blobs.push(blob_info);
        offset += to_read;
    }
    blobs.push(BlobInfo::new(
        blobs.len() as u32,
        0,
        hex::encode(iv_generator()),
        added_on,
        None,
        true,
    ));

    let file_name = file_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_string();
    let suggested_file_name = sanitize_file_name(&file_name, DEFAULT_FILE_NAME);
    let mut descriptor = StreamDescriptor::new(
        file_name,
        hex::encode(key),
        suggested_file_name,
        blobs,
        None,
    );
    let sd_blob = descriptor.make_sd_blob(manager, old_sort, true).await?;
    descriptor.sd_hash = Some(sd_blob.blob_hash().to_string());
    Ok(descriptor)
}

/// Reads the descriptor stored under `sd_hash` out of the local store.
pub async fn get_stream_descriptor(
    manager: &Arc<BlobManager>,
    sd_hash: &str,
) -> Result<StreamDescriptor, BlobError> {
    let sd_blob = manager.get_blob(sd_hash, None, false).await?;
    StreamDescriptor::from_stream_descriptor_blob(&sd_blob).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalu_blob::cipher::decrypt_blob_bytes;
    use nalu_blob::index::MemoryBlobIndex;
    use nalu_common::conf::Config;
    use nalu_common::hash::hash_blob_bytes;
    use sha2::{Digest, Sha384};
    use tempfile::{tempdir, TempDir};

    fn test_manager() -> (TempDir, Arc<BlobManager>) {
        let dir = tempdir().unwrap();
        let conf = Config {
            blob_dir: dir.path().join("blobs"),
            track_bandwidth: false,
            ..Default::default()
        };
        std::fs::create_dir_all(&conf.blob_dir).unwrap();
        let manager = BlobManager::new(conf, Arc::new(MemoryBlobIndex::new()));
        (dir, manager)
    }

    #[tokio::test]
    async fn test_single_blob_stream_round_trip() {
        let (dir, manager) = test_manager();
        let plaintext = b"fourteen bytes";
        assert_eq!(plaintext.len(), 14);
        let file_path = dir.path().join("plain.bin");
        std::fs::write(&file_path, plaintext).unwrap();

        let key = [0u8; KEY_SIZE];
        let iv = [0x0bu8; AES_BLOCK_SIZE];
        let descriptor = create_stream(
            &manager,
            &file_path,
            Some(key),
            Some(Box::new(move || iv)),
            false,
        )
        .await
        .unwrap();

        // exactly one ciphertext blob plus the terminator
        assert_eq!(descriptor.blobs.len(), 2);
        let data_blob = &descriptor.blobs[0];
        assert_eq!(data_blob.length, 16);
        assert_eq!(data_blob.blob_num, 0);
        let terminator = &descriptor.blobs[1];
        assert_eq!(terminator.length, 0);
        assert_eq!(terminator.blob_num, 1);
        assert!(terminator.blob_hash.is_none());

        // decrypting the stored ciphertext reproduces the plaintext
        let blob = manager
            .get_blob(data_blob.blob_hash.as_ref().unwrap(), None, false)
            .await
            .unwrap();
        assert!(blob.is_verified());
        assert_eq!(blob.decrypt(&key, &iv).await.unwrap(), plaintext);

        // the stream hash matches the deterministic formula
        let mut blob0 = Sha384::new();
        blob0.update(data_blob.blob_hash.as_ref().unwrap().as_bytes());
        blob0.update(b"0");
        blob0.update(data_blob.iv.as_bytes());
        blob0.update(b"16");
        let mut blob1 = Sha384::new();
        blob1.update(b"1");
        blob1.update(terminator.iv.as_bytes());
        blob1.update(b"0");
        let mut blobs_hashsum = Sha384::new();
        blobs_hashsum.update(blob0.finalize());
        blobs_hashsum.update(blob1.finalize());
        let mut outer = Sha384::new();
        outer.update(hex::encode(b"plain.bin").as_bytes());
        outer.update(hex::encode(key).as_bytes());
        outer.update(hex::encode(b"plain.bin").as_bytes());
        outer.update(blobs_hashsum.finalize());
        assert_eq!(descriptor.stream_hash, hex::encode(outer.finalize()));

        // the sd blob digest covers the canonical serialization
        let sd_hash = descriptor.sd_hash.clone().unwrap();
        assert_eq!(sd_hash, hash_blob_bytes(&descriptor.as_json()));
        let recovered = get_stream_descriptor(&manager, &sd_hash).await.unwrap();
        assert_eq!(recovered.stream_hash, descriptor.stream_hash);
    }

    #[tokio::test]
    async fn test_multi_blob_stream_decrypts_to_original() {
        let (dir, manager) = test_manager();
        // just over one chunk, so the stream splits into two data blobs
        let plaintext: Vec<u8> = (0..MAX_BLOB_SIZE - 1 + 1000)
            .map(|i| (i % 251) as u8)
            .collect();
        let file_path = dir.path().join("data.bin");
        std::fs::write(&file_path, &plaintext).unwrap();

        let key = [3u8; KEY_SIZE];
        let descriptor = create_stream(&manager, &file_path, Some(key), None, false)
            .await
            .unwrap();
        assert_eq!(descriptor.blobs.len(), 3);

        let mut decrypted = Vec::new();
        for blob_info in &descriptor.blobs[..descriptor.blobs.len() - 1] {
            let blob = manager
                .get_blob(blob_info.blob_hash.as_ref().unwrap(), None, false)
                .await
                .unwrap();
            let ciphertext = blob.open_reader().unwrap().read_to_end().await.unwrap();
            let iv = hex::decode(&blob_info.iv).unwrap();
            decrypted.extend(
                decrypt_blob_bytes(&ciphertext, blob_info.length, &key, &iv).unwrap(),
            );
        }
        assert_eq!(decrypted, plaintext);
        let bounds =
            descriptor.lower_bound_decrypted_length()..=descriptor.upper_bound_decrypted_length();
        assert!(bounds.contains(&(plaintext.len() as u64)));
    }

    #[tokio::test]
    async fn test_create_stream_deduplicates_identical_chunks() {
        let (dir, manager) = test_manager();
        let file_path = dir.path().join("dup.bin");
        std::fs::write(&file_path, b"same words").unwrap();

        let key = [1u8; KEY_SIZE];
        let iv = [2u8; AES_BLOCK_SIZE];
        let first = create_stream(
            &manager,
            &file_path,
            Some(key),
            Some(Box::new(move || iv)),
            false,
        )
        .await
        .unwrap();
        // same key, same iv, same contents: the data blob already exists
        let second = create_stream(
            &manager,
            &file_path,
            Some(key),
            Some(Box::new(move || iv)),
            false,
        )
        .await
        .unwrap();
        assert_eq!(first.blobs[0].blob_hash, second.blobs[0].blob_hash);
        assert_eq!(first.sd_hash, second.sd_hash);
    }
}
