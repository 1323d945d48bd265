//! Blob payload encoding
//!
//! Packs arbitrary bytes into the field-element layout of an EIP-4844 blob and
//! derives the KZG commitment, proof and versioned hash for it.

pub mod encoder;

pub use encoder::{
    decode_blob, encode_blob, kzg_to_versioned_hash, pack_blob, BlobCommitment, BlobSidecar,
    BLOB_SIZE, BYTES_PER_FIELD_ELEMENT, FIELD_ELEMENTS_PER_BLOB, MAX_BLOB_DATA,
    USABLE_BYTES_PER_FIELD_ELEMENT, VERSIONED_HASH_VERSION_KZG,
};

use thiserror::Error;

/// Blob encoding errors. None of these are retryable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BlobError {
    #[error("blob data longer than allowed (length: {length}, limit: {limit})")]
    TooLarge { length: usize, limit: usize },

    #[error("KZG error: {0}")]
    Kzg(String),
}

pub type BlobResult<T> = Result<T, BlobError>;
