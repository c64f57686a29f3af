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

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use nalu_common::error::BlobError;
use nalu_common::hash::hash_blob_bytes;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block size in bytes; also the IV length.
pub const AES_BLOCK_SIZE: usize = 16;

/// AES-256 key length in bytes.
pub const KEY_SIZE: usize = 32;

/// Encrypts a plaintext chunk with AES-256-CBC and PKCS7 padding,
/// returning the ciphertext together with its blob hash.
pub fn encrypt_blob_bytes(
    key: &[u8],
    iv: &[u8],
    unencrypted: &[u8],
) -> Result<(Vec<u8>, String), BlobError> {
    let encryptor = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|err| BlobError::InvalidData(format!("bad key or iv: {err}")))?;
    let encrypted = encryptor.encrypt_padded_vec_mut::<Pkcs7>(unencrypted);
    let blob_hash = hash_blob_bytes(&encrypted);
    Ok((encrypted, blob_hash))
}

/// Decrypts ciphertext of a known length, unpadding the result.
pub fn decrypt_blob_bytes(
    data: &[u8],
    length: u64,
    key: &[u8],
    iv: &[u8],
) -> Result<Vec<u8>, BlobError> {
    if data.len() as u64 != length {
        return Err(BlobError::InvalidData("unexpected length".to_string()));
    }
    let decryptor = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|err| BlobError::InvalidData(format!("bad key or iv: {err}")))?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|_| BlobError::InvalidData("invalid padding".to_string()))
}
