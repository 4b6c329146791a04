// Package hash and detached signatures
//
// The package hash is SHA-256 over the package image with the hash
// field zeroed and the signature region excised. The signature region,
// when present, is a detached-signature blob: a fixed header naming the
// algorithm, then the public key and signature bytes.

use super::format::{EPK_HASH_SIZE, EPK_PACKAGE_HASH_OFFSET};
use sha2::{Digest, Sha256};

pub const DETACHED_SIGNATURE_MAGIC: u32 = 0x5347_4953; // "SIGS"
pub const DETACHED_SIGNATURE_VERSION: u32 = 1;

pub const SIGNATURE_ALGORITHM_NONE: u32 = 0;
pub const SIGNATURE_ALGORITHM_ED25519: u32 = 1;
pub const SIGNATURE_ALGORITHM_RSA_PKCS1_V15_SHA256: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SignatureStatus {
    Ok = 0,
    InvalidArgument = 1,
    FormatError = 2,
    UnsupportedAlgorithm = 3,
    InvalidSignature = 4,
    InternalError = 5,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct DetachedSignatureHeader {
    pub magic: u32,
    pub version: u32,
    pub algorithm: u32,
    pub reserved: u32,
    pub public_key_offset: u64,
    pub public_key_size: u64,
    pub signature_offset: u64,
    pub signature_size: u64,
}

pub const DETACHED_SIGNATURE_HEADER_SIZE: usize =
    core::mem::size_of::<DetachedSignatureHeader>();

/// SHA-256 of the package image with the hash field zeroed and the
/// signature region excised: the first `signature_offset` bytes (hash
/// field blanked), then the tail past `signature_offset +
/// signature_size`.
pub fn compute_package_hash(
    package: &[u8],
    signature_offset: usize,
    signature_size: usize,
) -> [u8; EPK_HASH_SIZE] {
    let mut hasher = Sha256::new();

    let head_end = signature_offset.min(package.len());
    hasher.update(&package[..EPK_PACKAGE_HASH_OFFSET.min(head_end)]);
    if head_end > EPK_PACKAGE_HASH_OFFSET {
        let zero_end = (EPK_PACKAGE_HASH_OFFSET + EPK_HASH_SIZE).min(head_end);
        hasher.update(&[0u8; EPK_HASH_SIZE][..zero_end - EPK_PACKAGE_HASH_OFFSET]);
        hasher.update(&package[zero_end..head_end]);
    }

    let tail_start = signature_offset.saturating_add(signature_size);
    if tail_start < package.len() {
        hasher.update(&package[tail_start..]);
    }

    let digest = hasher.finalize();
    let mut hash = [0u8; EPK_HASH_SIZE];
    hash.copy_from_slice(&digest);
    hash
}

/// Check the recorded package hash against a recomputed one.
pub fn verify_package_hash(
    package: &[u8],
    recorded: &[u8; EPK_HASH_SIZE],
    signature_offset: usize,
    signature_size: usize,
) -> bool {
    compute_package_hash(package, signature_offset, signature_size) == *recorded
}

/// Verify a detached signature over `payload` with an explicit
/// algorithm, key and signature.
pub fn verify_detached(
    algorithm: u32,
    public_key: &[u8],
    payload: &[u8],
    signature: &[u8],
) -> SignatureStatus {
    match algorithm {
        SIGNATURE_ALGORITHM_NONE => SignatureStatus::Ok,
        SIGNATURE_ALGORITHM_ED25519 => {
            use ed25519_dalek::{Signature, VerifyingKey};

            let key_bytes: [u8; 32] = match public_key.try_into() {
                Ok(bytes) => bytes,
                Err(_) => return SignatureStatus::FormatError,
            };
            let signature_bytes: [u8; 64] = match signature.try_into() {
                Ok(bytes) => bytes,
                Err(_) => return SignatureStatus::FormatError,
            };

            match VerifyingKey::from_bytes(&key_bytes) {
                Ok(key) => {
                    let signature = Signature::from_bytes(&signature_bytes);
                    if key.verify_strict(payload, &signature).is_ok() {
                        SignatureStatus::Ok
                    } else {
                        SignatureStatus::InvalidSignature
                    }
                }
                Err(_) => SignatureStatus::FormatError,
            }
        }
        SIGNATURE_ALGORITHM_RSA_PKCS1_V15_SHA256 => SignatureStatus::UnsupportedAlgorithm,
        _ => SignatureStatus::UnsupportedAlgorithm,
    }
}

/// Parse a detached-signature blob and verify it over `payload`.
/// Offsets inside the blob are relative to its start.
pub fn verify_detached_blob(blob: &[u8], payload: &[u8]) -> SignatureStatus {
    let header: DetachedSignatureHeader = match super::format::read_record(blob, 0) {
        Some(header) => header,
        None => return SignatureStatus::FormatError,
    };

    if header.magic != DETACHED_SIGNATURE_MAGIC {
        return SignatureStatus::FormatError;
    }
    if header.version != DETACHED_SIGNATURE_VERSION {
        return SignatureStatus::FormatError;
    }

    let slice_of = |offset: u64, size: u64| -> Option<&[u8]> {
        let start = usize::try_from(offset).ok()?;
        let length = usize::try_from(size).ok()?;
        let end = start.checked_add(length)?;
        if end > blob.len() {
            return None;
        }
        Some(&blob[start..end])
    };

    let public_key = match slice_of(header.public_key_offset, header.public_key_size) {
        Some(bytes) => bytes,
        None => return SignatureStatus::FormatError,
    };
    let signature = match slice_of(header.signature_offset, header.signature_size) {
        Some(bytes) => bytes,
        None => return SignatureStatus::FormatError,
    };

    verify_detached(header.algorithm, public_key, payload, signature)
}

/// Build a detached-signature blob over `payload` with a fixed test
/// key, the way the host-side packer lays it out.
#[cfg(test)]
pub fn build_signature_blob(payload: &[u8]) -> alloc::vec::Vec<u8> {
    use ed25519_dalek::SigningKey;
    use signature::Signer;

    let key = SigningKey::from_bytes(&[0x42u8; 32]);
    let signature = key.sign(payload);

    let mut blob = alloc::vec::Vec::new();
    let header = DetachedSignatureHeader {
        magic: DETACHED_SIGNATURE_MAGIC,
        version: DETACHED_SIGNATURE_VERSION,
        algorithm: SIGNATURE_ALGORITHM_ED25519,
        reserved: 0,
        public_key_offset: DETACHED_SIGNATURE_HEADER_SIZE as u64,
        public_key_size: 32,
        signature_offset: DETACHED_SIGNATURE_HEADER_SIZE as u64 + 32,
        signature_size: 64,
    };
    blob.extend_from_slice(unsafe {
        core::slice::from_raw_parts(
            &header as *const _ as *const u8,
            DETACHED_SIGNATURE_HEADER_SIZE,
        )
    });
    blob.extend_from_slice(key.verifying_key().as_bytes());
    blob.extend_from_slice(&signature.to_bytes());
    blob
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ed25519_blob_verifies_and_rejects_tampering() {
        let payload = [0xA5u8; 32];
        let blob = build_signature_blob(&payload);

        assert_eq!(verify_detached_blob(&blob, &payload), SignatureStatus::Ok);

        let mut wrong_payload = payload;
        wrong_payload[0] ^= 1;
        assert_eq!(
            verify_detached_blob(&blob, &wrong_payload),
            SignatureStatus::InvalidSignature
        );

        let mut bad_magic = blob.clone();
        bad_magic[0] ^= 0xFF;
        assert_eq!(
            verify_detached_blob(&bad_magic, &payload),
            SignatureStatus::FormatError
        );
    }

    #[test]
    fn hash_zeroes_the_hash_field_and_excises_the_signature() {
        // Two images differing only inside the hash field hash alike.
        let mut image_a = alloc::vec![0u8; 200];
        let mut image_b = image_a.clone();
        image_a[EPK_PACKAGE_HASH_OFFSET] = 0x11;
        image_b[EPK_PACKAGE_HASH_OFFSET] = 0x99;
        assert_eq!(
            compute_package_hash(&image_a, 200, 0),
            compute_package_hash(&image_b, 200, 0)
        );

        // Bytes inside the signature region do not participate.
        let mut signed = alloc::vec![0u8; 200];
        let hash_before = compute_package_hash(&signed, 150, 50);
        signed[160] = 0xEE;
        assert_eq!(hash_before, compute_package_hash(&signed, 150, 50));

        // Bytes outside it do.
        signed[140] = 0xEE;
        assert_ne!(hash_before, compute_package_hash(&signed, 150, 50));
    }
}
