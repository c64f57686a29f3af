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

use nalu_blob::blob::Blob;
use nalu_blob::cipher::AES_BLOCK_SIZE;
use nalu_blob::BlobManager;
use nalu_common::error::BlobError;
use nalu_common::hash::{blob_hasher, hash_blob_bytes};
use nalu_common::utils::now_timestamp;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::sync::Arc;
use tracing::warn;

/// File name used when a suggested name sanitizes down to nothing.
pub const DEFAULT_FILE_NAME: &str = "lbry_download";

const STREAM_TYPE: &str = "lbryfile";

/// One element of a stream's blob list. The final element is a
/// terminator with length zero and no hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobInfo {
    pub blob_num: u32,
    pub length: u64,
    pub iv: String,
    pub added_on: u64,
    pub blob_hash: Option<String>,
    pub is_mine: bool,
}

impl BlobInfo {
    pub fn new(
        blob_num: u32,
        length: u64,
        iv: String,
        added_on: u64,
        blob_hash: Option<String>,
        is_mine: bool,
    ) -> Self {
        Self {
            blob_num,
            length,
            iv,
            added_on,
            blob_hash,
            is_mine,
        }
    }
}

// wire forms: field declaration order is emission order

#[derive(Serialize)]
struct SortedBlobEntry<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    blob_hash: Option<&'a str>,
    blob_num: u32,
    iv: &'a str,
    length: u64,
}

#[derive(Serialize)]
struct SortedDescriptor<'a> {
    blobs: Vec<SortedBlobEntry<'a>>,
    key: &'a str,
    stream_hash: &'a str,
    stream_name: String,
    stream_type: &'static str,
    suggested_file_name: String,
}

#[derive(Serialize)]
struct LegacyBlobEntry<'a> {
    length: u64,
    blob_num: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    blob_hash: Option<&'a str>,
    iv: &'a str,
}

#[derive(Serialize)]
struct LegacyDescriptor<'a> {
    stream_name: String,
    blobs: Vec<LegacyBlobEntry<'a>>,
    stream_type: &'static str,
    key: &'a str,
    suggested_file_name: String,
    stream_hash: &'a str,
}

#[derive(Deserialize)]
struct RawBlobEntry {
    length: u64,
    blob_num: u32,
    iv: String,
    #[serde(default)]
    blob_hash: Option<String>,
}

#[derive(Deserialize)]
struct RawDescriptor {
    stream_name: String,
    key: String,
    suggested_file_name: String,
    stream_hash: String,
    blobs: Vec<RawBlobEntry>,
}

/// Manifest tying an ordered list of blobs into a stream; itself stored
/// as a blob.
///
/// Two historical serializations exist: the current form sorts keys
/// lexicographically, the legacy form uses a fixed field order. A
/// descriptor is recognized if its digest matches either one; the
/// ordering is never inferred from content.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamDescriptor {
    pub stream_name: String,
    /// Hex-encoded symmetric key, treated opaquely.
    pub key: String,
    pub suggested_file_name: String,
    pub blobs: Vec<BlobInfo>,
    pub stream_hash: String,
    pub sd_hash: Option<String>,
}

impl StreamDescriptor {
    pub fn new(
        stream_name: String,
        key: String,
        suggested_file_name: String,
        blobs: Vec<BlobInfo>,
        stream_hash: Option<String>,
    ) -> Self {
        let stream_hash = stream_hash.unwrap_or_else(|| {
            Self::calculate_stream_hash(
                &hex::encode(stream_name.as_bytes()),
                &key,
                &hex::encode(suggested_file_name.as_bytes()),
                &blobs,
            )
        });
        Self {
            stream_name,
            key,
            suggested_file_name,
            blobs,
            stream_hash,
            sd_hash: None,
        }
    }

    pub fn get_stream_hash(&self) -> String {
        Self::calculate_stream_hash(
            &hex::encode(self.stream_name.as_bytes()),
            &self.key,
            &hex::encode(self.suggested_file_name.as_bytes()),
            &self.blobs,
        )
    }

    fn get_blob_hashsum(info: &BlobInfo) -> Vec<u8> {
        let mut hasher = blob_hasher();
        if info.length != 0 {
            if let Some(blob_hash) = &info.blob_hash {
                hasher.update(blob_hash.as_bytes());
            }
        }
        hasher.update(info.blob_num.to_string().as_bytes());
        hasher.update(info.iv.as_bytes());
        hasher.update(info.length.to_string().as_bytes());
        hasher.finalize().to_vec()
    }

    /// `H(hex(name) ‖ key ‖ hex(suggested_name) ‖ H(∑ H(blob_info)))`,
    /// all inputs as ascii hex.
    pub fn calculate_stream_hash(
        hex_stream_name: &str,
        key: &str,
        hex_suggested_file_name: &str,
        blobs: &[BlobInfo],
    ) -> String {
        let mut hasher = blob_hasher();
        hasher.update(hex_stream_name.as_bytes());
        hasher.update(key.as_bytes());
        hasher.update(hex_suggested_file_name.as_bytes());
        let mut blobs_hashsum = blob_hasher();
        for info in blobs {
            blobs_hashsum.update(&Self::get_blob_hashsum(info));
        }
        hasher.update(&blobs_hashsum.finalize());
        hex::encode(hasher.finalize())
    }

    /// Canonical bytes: compact json with keys sorted lexicographically.
    pub fn as_json(&self) -> Vec<u8> {
        let entries = self
            .blobs
            .iter()
            .map(|info| SortedBlobEntry {
                blob_hash: info.blob_hash.as_deref(),
                blob_num: info.blob_num,
                iv: &info.iv,
                length: info.length,
            })
            .collect();
        serde_json::to_vec(&SortedDescriptor {
            blobs: entries,
            key: &self.key,
            stream_hash: &self.stream_hash,
            stream_name: hex::encode(self.stream_name.as_bytes()),
            stream_type: STREAM_TYPE,
            suggested_file_name: hex::encode(self.suggested_file_name.as_bytes()),
        })
        .expect("descriptor serialization")
    }

    /// Historical bytes: fixed field order, blob list cut at the
    /// terminator.
    pub fn old_sort_json(&self) -> Vec<u8> {
        let mut entries = Vec::new();
        for info in &self.blobs {
            entries.push(LegacyBlobEntry {
                length: info.length,
                blob_num: info.blob_num,
                blob_hash: info.blob_hash.as_deref(),
                iv: &info.iv,
            });
            if info.blob_hash.is_none() {
                break;
            }
        }
        serde_json::to_vec(&LegacyDescriptor {
            stream_name: hex::encode(self.stream_name.as_bytes()),
            blobs: entries,
            stream_type: STREAM_TYPE,
            key: &self.key,
            suggested_file_name: hex::encode(self.suggested_file_name.as_bytes()),
            stream_hash: &self.stream_hash,
        })
        .expect("descriptor serialization")
    }

    pub fn calculate_sd_hash(&self) -> String {
        hash_blob_bytes(&self.as_json())
    }

    pub fn calculate_old_sort_sd_hash(&self) -> String {
        hash_blob_bytes(&self.old_sort_json())
    }

    /// Serializes the descriptor, stores it as a verified blob, and
    /// returns that blob.
    pub async fn make_sd_blob(
        &self,
        manager: &Arc<BlobManager>,
        old_sort: bool,
        is_mine: bool,
    ) -> Result<Arc<Blob>, BlobError> {
        let sd_data = if old_sort {
            self.old_sort_json()
        } else {
            self.as_json()
        };
        let sd_hash = hash_blob_bytes(&sd_data);
        let sd_blob = manager
            .get_blob(&sd_hash, Some(sd_data.len() as u64), is_mine)
            .await?;
        if !sd_blob.is_verified() {
            let mut writer = sd_blob.get_blob_writer(None, None)?;
            writer.write(&sd_data)?;
        }
        sd_blob.wait_verified().await;
        sd_blob.close();
        Ok(sd_blob)
    }

    /// Reads and validates a stream descriptor out of its blob. A
    /// structurally invalid descriptor is deleted from the local store.
    pub async fn from_stream_descriptor_blob(
        blob: &Arc<Blob>,
    ) -> Result<StreamDescriptor, BlobError> {
        if !blob.is_readable() {
            return Err(BlobError::InvalidStreamDescriptor(format!(
                "unreadable/missing blob: {}",
                blob.blob_hash()
            )));
        }
        let json_bytes = blob.open_reader()?.read_to_end().await?;
        let raw: RawDescriptor = match serde_json::from_slice(&json_bytes) {
            Ok(raw) => raw,
            Err(_) => return Err(Self::reject(blob, "does not decode as valid JSON")),
        };
        let Some(terminator) = raw.blobs.last() else {
            return Err(Self::reject(blob, "does not end with a zero-length blob"));
        };
        if terminator.length != 0 {
            return Err(Self::reject(blob, "does not end with a zero-length blob"));
        }
        if raw.blobs[..raw.blobs.len() - 1]
            .iter()
            .any(|entry| entry.length == 0)
        {
            return Err(Self::reject(blob, "contains zero-length data blob"));
        }
        if terminator.blob_hash.is_some() {
            return Err(Self::reject(
                blob,
                "stream terminator blob should not have a hash",
            ));
        }
        if raw
            .blobs
            .iter()
            .enumerate()
            .any(|(i, entry)| entry.blob_num as usize != i)
        {
            return Err(Self::reject(
                blob,
                "stream contains out of order or skipped blobs",
            ));
        }
        let stream_name = match hex::decode(&raw.stream_name)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
        {
            Some(name) => name,
            None => return Err(Self::reject(blob, "stream name is not valid hex")),
        };
        let suggested_file_name = match hex::decode(&raw.suggested_file_name)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
        {
            Some(name) => name,
            None => return Err(Self::reject(blob, "suggested file name is not valid hex")),
        };
        let added_on = now_timestamp();
        let descriptor = StreamDescriptor {
            stream_name,
            key: raw.key,
            suggested_file_name,
            blobs: raw
                .blobs
                .into_iter()
                .map(|entry| BlobInfo {
                    blob_num: entry.blob_num,
                    length: entry.length,
                    iv: entry.iv,
                    added_on,
                    blob_hash: entry.blob_hash,
                    is_mine: false,
                })
                .collect(),
            stream_hash: raw.stream_hash,
            sd_hash: Some(blob.blob_hash().to_string()),
        };
        if descriptor.get_stream_hash() != descriptor.stream_hash {
            return Err(Self::reject(
                blob,
                "stream hash does not match stream metadata",
            ));
        }
        Ok(descriptor)
    }

    fn reject(blob: &Arc<Blob>, reason: &str) -> BlobError {
        warn!("deleting invalid stream descriptor {}: {reason}", blob.blob_hash());
        blob.delete();
        BlobError::InvalidStreamDescriptor(reason.to_string())
    }

    /// Rebuilds a descriptor from recovered metadata, accepting it only
    /// if one of the two serializations reproduces the sd blob's hash.
    /// The sd blob is rewritten on success.
    pub async fn recover(
        manager: &Arc<BlobManager>,
        sd_blob: &Arc<Blob>,
        stream_hash: String,
        stream_name: String,
        suggested_file_name: String,
        key: String,
        blobs: Vec<BlobInfo>,
    ) -> Result<Option<StreamDescriptor>, BlobError> {
        let mut descriptor = StreamDescriptor {
            stream_name,
            key,
            suggested_file_name,
            blobs,
            stream_hash,
            sd_hash: Some(sd_blob.blob_hash().to_string()),
        };
        let old_sort = if descriptor.calculate_sd_hash() == sd_blob.blob_hash() {
            false
        } else if descriptor.calculate_old_sort_sd_hash() == sd_blob.blob_hash() {
            true
        } else {
            return Ok(None);
        };
        let rebuilt = descriptor.make_sd_blob(manager, old_sort, false).await?;
        descriptor.sd_hash = Some(rebuilt.blob_hash().to_string());
        Ok(Some(descriptor))
    }

    /// Size of the decrypted stream assuming maximal final padding.
    pub fn lower_bound_decrypted_length(&self) -> u64 {
        if self.blobs.len() < 2 {
            return 0;
        }
        let data_blobs = &self.blobs[..self.blobs.len() - 1];
        let all_but_last: u64 = data_blobs[..data_blobs.len() - 1]
            .iter()
            .map(|info| info.length - 1)
            .sum();
        all_but_last + data_blobs[data_blobs.len() - 1].length - AES_BLOCK_SIZE as u64
    }

    pub fn upper_bound_decrypted_length(&self) -> u64 {
        self.lower_bound_decrypted_length() + AES_BLOCK_SIZE as u64
    }
}

/// Strips reserved characters, control characters, surrounding
/// whitespace, trailing dots, and reserved device names from a
/// suggested file name. Applies only to names written to the local
/// filesystem, never to names embedded in a descriptor.
pub fn sanitize_file_name(dirty_name: &str, default_file_name: &str) -> String {
    let (stem, extension) = split_extension(dirty_name);
    let stem = strip_illegal(stem);
    let extension = strip_illegal(extension);
    let mut file_name = if stem.is_empty() {
        warn!(
            "unable to sanitize file name for {dirty_name}, returning default value {default_file_name}"
        );
        default_file_name.to_string()
    } else {
        stem
    };
    if extension.len() > 1 {
        file_name.push_str(&extension);
    }
    file_name
}

/// Splits a name into stem and extension, where the extension starts at
/// the last dot preceded by a non-dot character.
fn split_extension(name: &str) -> (&str, &str) {
    if let Some(index) = name.rfind('.') {
        if name[..index].chars().any(|c| c != '.') {
            return (&name[..index], &name[index..]);
        }
    }
    (name, "")
}

fn strip_illegal(name: &str) -> String {
    let mut out: String = name
        .chars()
        .filter(|&c| {
            !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*')
                && !('\u{0}'..='\u{1f}').contains(&c)
        })
        .collect();
    out = out
        .trim_matches(|c| c == ' ' || c == '\t')
        .trim_end_matches(|c| c == '.' || c == ' ' || c == '\t')
        .to_string();
    if is_reserved_name(&out) {
        out.clear();
    }
    out
}

fn is_reserved_name(name: &str) -> bool {
    matches!(name, "CON" | "PRN" | "AUX" | "NUL")
        || (name.len() == 4
            && (name.starts_with("COM") || name.starts_with("LPT"))
            && name.ends_with(|c| ('1'..='9').contains(&c)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalu_blob::index::MemoryBlobIndex;
    use nalu_common::conf::Config;
    use nalu_common::hash::is_valid_blobhash;
    use tempfile::{tempdir, TempDir};

    fn test_manager() -> (TempDir, Arc<BlobManager>) {
        let dir = tempdir().unwrap();
        let conf = Config {
            blob_dir: dir.path().to_path_buf(),
            track_bandwidth: false,
            ..Default::default()
        };
        let manager = BlobManager::new(conf, Arc::new(MemoryBlobIndex::new()));
        (dir, manager)
    }

    fn sample_descriptor() -> StreamDescriptor {
        let data_blob = BlobInfo::new(
            0,
            16,
            "0b".repeat(16),
            1_700_000_000,
            Some("ab".repeat(48)),
            true,
        );
        let terminator = BlobInfo::new(1, 0, "0c".repeat(16), 1_700_000_000, None, true);
        StreamDescriptor::new(
            "movie.mp4".to_string(),
            "11".repeat(32),
            "movie.mp4".to_string(),
            vec![data_blob, terminator],
            None,
        )
    }

    #[test]
    fn test_sorted_serialization_shape() {
        let descriptor = sample_descriptor();
        let json = String::from_utf8(descriptor.as_json()).unwrap();
        let expected = format!(
            "{{\"blobs\":[{{\"blob_hash\":\"{}\",\"blob_num\":0,\"iv\":\"{}\",\"length\":16}},\
             {{\"blob_num\":1,\"iv\":\"{}\",\"length\":0}}],\"key\":\"{}\",\"stream_hash\":\"{}\",\
             \"stream_name\":\"{}\",\"stream_type\":\"lbryfile\",\"suggested_file_name\":\"{}\"}}",
            "ab".repeat(48),
            "0b".repeat(16),
            "0c".repeat(16),
            "11".repeat(32),
            descriptor.stream_hash,
            hex::encode(b"movie.mp4"),
            hex::encode(b"movie.mp4"),
        );
        assert_eq!(json, expected);
    }

    #[test]
    fn test_legacy_serialization_shape() {
        let descriptor = sample_descriptor();
        let json = String::from_utf8(descriptor.old_sort_json()).unwrap();
        assert!(json.starts_with(&format!(
            "{{\"stream_name\":\"{}\",\"blobs\":[{{\"length\":16,\"blob_num\":0,",
            hex::encode(b"movie.mp4")
        )));
        assert!(json.ends_with(&format!("\"stream_hash\":\"{}\"}}", descriptor.stream_hash)));
        assert_ne!(
            descriptor.calculate_sd_hash(),
            descriptor.calculate_old_sort_sd_hash()
        );
    }

    #[test]
    fn test_stream_hash_formula() {
        use sha2::Sha384;
        let descriptor = sample_descriptor();

        let mut blob0 = Sha384::new();
        blob0.update("ab".repeat(48).as_bytes());
        blob0.update(b"0");
        blob0.update("0b".repeat(16).as_bytes());
        blob0.update(b"16");
        let mut blob1 = Sha384::new();
        blob1.update(b"1");
        blob1.update("0c".repeat(16).as_bytes());
        blob1.update(b"0");
        let mut blobs_hashsum = Sha384::new();
        blobs_hashsum.update(blob0.finalize());
        blobs_hashsum.update(blob1.finalize());
        let mut outer = Sha384::new();
        outer.update(hex::encode(b"movie.mp4").as_bytes());
        outer.update("11".repeat(32).as_bytes());
        outer.update(hex::encode(b"movie.mp4").as_bytes());
        outer.update(blobs_hashsum.finalize());

        assert_eq!(descriptor.stream_hash, hex::encode(outer.finalize()));
        assert!(is_valid_blobhash(&descriptor.stream_hash));
    }

    #[tokio::test]
    async fn test_sorted_round_trip() {
        let (_dir, manager) = test_manager();
        let descriptor = sample_descriptor();
        let sd_blob = descriptor.make_sd_blob(&manager, false, true).await.unwrap();
        assert_eq!(sd_blob.blob_hash(), descriptor.calculate_sd_hash());

        let recovered = StreamDescriptor::from_stream_descriptor_blob(&sd_blob)
            .await
            .unwrap();
        assert_eq!(recovered.stream_name, descriptor.stream_name);
        assert_eq!(recovered.key, descriptor.key);
        assert_eq!(recovered.suggested_file_name, descriptor.suggested_file_name);
        assert_eq!(recovered.stream_hash, descriptor.stream_hash);
        assert_eq!(recovered.blobs.len(), descriptor.blobs.len());
        for (theirs, ours) in recovered.blobs.iter().zip(&descriptor.blobs) {
            assert_eq!(theirs.blob_num, ours.blob_num);
            assert_eq!(theirs.length, ours.length);
            assert_eq!(theirs.iv, ours.iv);
            assert_eq!(theirs.blob_hash, ours.blob_hash);
        }
        assert_eq!(recovered.sd_hash.as_deref(), Some(sd_blob.blob_hash()));
    }

    #[tokio::test]
    async fn test_legacy_round_trip_preserves_legacy_hash() {
        let (_dir, manager) = test_manager();
        let descriptor = sample_descriptor();
        let sd_blob = descriptor.make_sd_blob(&manager, true, true).await.unwrap();
        assert_eq!(sd_blob.blob_hash(), descriptor.calculate_old_sort_sd_hash());

        let recovered = StreamDescriptor::from_stream_descriptor_blob(&sd_blob)
            .await
            .unwrap();
        assert_eq!(recovered.stream_hash, descriptor.stream_hash);
        assert_eq!(
            recovered.calculate_old_sort_sd_hash(),
            sd_blob.blob_hash()
        );
    }

    #[tokio::test]
    async fn test_recover_identifies_the_ordering() {
        let (_dir, manager) = test_manager();
        let descriptor = sample_descriptor();
        let sd_blob = descriptor.make_sd_blob(&manager, true, true).await.unwrap();

        let recovered = StreamDescriptor::recover(
            &manager,
            &sd_blob,
            descriptor.stream_hash.clone(),
            descriptor.stream_name.clone(),
            descriptor.suggested_file_name.clone(),
            descriptor.key.clone(),
            descriptor.blobs.clone(),
        )
        .await
        .unwrap()
        .expect("legacy ordering should match");
        assert_eq!(recovered.stream_hash, descriptor.stream_hash);

        // metadata that matches neither ordering is refused
        let mismatch = StreamDescriptor::recover(
            &manager,
            &sd_blob,
            descriptor.stream_hash.clone(),
            "other name".to_string(),
            descriptor.suggested_file_name.clone(),
            descriptor.key.clone(),
            descriptor.blobs.clone(),
        )
        .await
        .unwrap();
        assert!(mismatch.is_none());
    }

    async fn store_raw_sd_blob(
        manager: &Arc<BlobManager>,
        json: &[u8],
    ) -> Arc<Blob> {
        let blob_hash = hash_blob_bytes(json);
        let blob = manager
            .get_blob(&blob_hash, Some(json.len() as u64), false)
            .await
            .unwrap();
        let mut writer = blob.get_blob_writer(None, None).unwrap();
        writer.write(json).unwrap();
        blob.wait_verified().await;
        blob
    }

    #[tokio::test]
    async fn test_terminator_in_middle_deletes_blob() {
        let (dir, manager) = test_manager();
        let descriptor = sample_descriptor();
        let mut bad = descriptor.clone();
        bad.blobs.insert(
            1,
            BlobInfo::new(1, 0, "0d".repeat(16), 0, None, false),
        );
        bad.blobs[2].blob_num = 2;
        bad.stream_hash = bad.get_stream_hash();
        let sd_blob = store_raw_sd_blob(&manager, &bad.as_json()).await;
        let sd_hash = sd_blob.blob_hash().to_string();
        assert!(dir.path().join(&sd_hash).is_file());

        let err = StreamDescriptor::from_stream_descriptor_blob(&sd_blob)
            .await
            .expect_err("terminator in the middle");
        assert!(matches!(err, BlobError::InvalidStreamDescriptor(_)));
        assert!(!sd_blob.is_verified());
        assert!(!dir.path().join(&sd_hash).is_file());
    }

    #[tokio::test]
    async fn test_terminator_with_hash_rejected() {
        let (_dir, manager) = test_manager();
        let mut bad = sample_descriptor();
        bad.blobs.last_mut().unwrap().blob_hash = Some("cd".repeat(48));
        bad.stream_hash = bad.get_stream_hash();
        let sd_blob = store_raw_sd_blob(&manager, &bad.as_json()).await;
        assert!(StreamDescriptor::from_stream_descriptor_blob(&sd_blob)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_out_of_order_blob_nums_rejected() {
        let (_dir, manager) = test_manager();
        let mut bad = sample_descriptor();
        bad.blobs[0].blob_num = 5;
        bad.stream_hash = bad.get_stream_hash();
        let sd_blob = store_raw_sd_blob(&manager, &bad.as_json()).await;
        assert!(StreamDescriptor::from_stream_descriptor_blob(&sd_blob)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_garbage_json_rejected_and_deleted() {
        let (dir, manager) = test_manager();
        let sd_blob = store_raw_sd_blob(&manager, b"{not even json").await;
        let sd_hash = sd_blob.blob_hash().to_string();
        assert!(StreamDescriptor::from_stream_descriptor_blob(&sd_blob)
            .await
            .is_err());
        assert!(!dir.path().join(&sd_hash).is_file());
    }

    #[tokio::test]
    async fn test_stream_hash_mismatch_rejected() {
        let (_dir, manager) = test_manager();
        let mut bad = sample_descriptor();
        bad.stream_hash = "99".repeat(48);
        let sd_blob = store_raw_sd_blob(&manager, &bad.as_json()).await;
        let err = StreamDescriptor::from_stream_descriptor_blob(&sd_blob)
            .await
            .expect_err("stream hash mismatch");
        assert!(matches!(err, BlobError::InvalidStreamDescriptor(_)));
    }

    #[test]
    fn test_decrypted_length_bounds() {
        let descriptor = sample_descriptor();
        assert_eq!(descriptor.lower_bound_decrypted_length(), 0);
        assert_eq!(descriptor.upper_bound_decrypted_length(), 16);
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("movie.mp4", DEFAULT_FILE_NAME), "movie.mp4");
        assert_eq!(
            sanitize_file_name("a<b>c:d\"e/f\\g|h?i*j.txt", DEFAULT_FILE_NAME),
            "abcdefghij.txt"
        );
        assert_eq!(sanitize_file_name("  spaced  .txt", DEFAULT_FILE_NAME), "spaced.txt");
        assert_eq!(sanitize_file_name("trailing...", DEFAULT_FILE_NAME), "trailing");
        assert_eq!(sanitize_file_name("\x01\x02.txt", DEFAULT_FILE_NAME), "lbry_download.txt");
        assert_eq!(sanitize_file_name("CON", DEFAULT_FILE_NAME), "lbry_download");
        assert_eq!(sanitize_file_name("COM1", DEFAULT_FILE_NAME), "lbry_download");
        assert_eq!(sanitize_file_name("LPT9.log", DEFAULT_FILE_NAME), "lbry_download.log");
        assert_eq!(sanitize_file_name("", DEFAULT_FILE_NAME), "lbry_download");
        // lowercase device names are ordinary file names
        assert_eq!(sanitize_file_name("con", DEFAULT_FILE_NAME), "con");
    }
}
