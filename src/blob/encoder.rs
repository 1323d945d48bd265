use super::{BlobError, BlobResult};
use crate::types::TxHash;
use c_kzg::{Blob, Bytes48, KzgCommitment, KzgProof, KzgSettings};
use sha2::{Digest, Sha256};

pub const FIELD_ELEMENTS_PER_BLOB: usize = 4096;
pub const BYTES_PER_FIELD_ELEMENT: usize = 32;
/// The leading byte of each field element stays zero to keep it below the modulus
pub const USABLE_BYTES_PER_FIELD_ELEMENT: usize = BYTES_PER_FIELD_ELEMENT - 1;
pub const BLOB_SIZE: usize = FIELD_ELEMENTS_PER_BLOB * BYTES_PER_FIELD_ELEMENT;
pub const MAX_BLOB_DATA: usize = FIELD_ELEMENTS_PER_BLOB * USABLE_BYTES_PER_FIELD_ELEMENT;
pub const VERSIONED_HASH_VERSION_KZG: u8 = 0x01;

/// A packed blob with its commitment triple
#[derive(Clone)]
pub struct BlobCommitment {
    pub blob: Box<[u8; BLOB_SIZE]>,
    pub commitment: [u8; 48],
    pub proof: [u8; 48],
    pub versioned_hash: TxHash,
    /// Length of the payload packed into `blob`
    pub data_len: usize,
}

impl std::fmt::Debug for BlobCommitment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobCommitment")
            .field("commitment", &hex::encode(self.commitment))
            .field("proof", &hex::encode(self.proof))
            .field("versioned_hash", &self.versioned_hash)
            .field("data_len", &self.data_len)
            .finish_non_exhaustive()
    }
}

fn kzg_settings() -> &'static KzgSettings {
    c_kzg::ethereum_kzg_settings()
}

fn kzg_error(stage: &str, err: c_kzg::Error) -> BlobError {
    BlobError::Kzg(format!("{}: {:?}", stage, err))
}

/// Pack `data` into a blob, 31 bytes per field element at offset 1
pub fn pack_blob(data: &[u8]) -> BlobResult<Box<[u8; BLOB_SIZE]>> {
    if data.len() > MAX_BLOB_DATA {
        return Err(BlobError::TooLarge {
            length: data.len(),
            limit: MAX_BLOB_DATA,
        });
    }

    let mut blob = Box::new([0u8; BLOB_SIZE]);
    for (field, chunk) in data.chunks(USABLE_BYTES_PER_FIELD_ELEMENT).enumerate() {
        let start = field * BYTES_PER_FIELD_ELEMENT + 1;
        blob[start..start + chunk.len()].copy_from_slice(chunk);
    }
    Ok(blob)
}

/// Reverse [`pack_blob`], returning the first `data_len` payload bytes
pub fn decode_blob(blob: &[u8; BLOB_SIZE], data_len: usize) -> Vec<u8> {
    let data_len = data_len.min(MAX_BLOB_DATA);
    let mut out = Vec::with_capacity(data_len);
    for field in blob.chunks(BYTES_PER_FIELD_ELEMENT) {
        if out.len() >= data_len {
            break;
        }
        let take = (data_len - out.len()).min(USABLE_BYTES_PER_FIELD_ELEMENT);
        out.extend_from_slice(&field[1..1 + take]);
    }
    out
}

/// sha256 of the commitment with the first byte replaced by the version tag
pub fn kzg_to_versioned_hash(commitment: &[u8; 48]) -> TxHash {
    let digest = Sha256::digest(commitment);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&digest);
    hash[0] = VERSIONED_HASH_VERSION_KZG;
    TxHash::new(hash)
}

/// Pack `data` and derive commitment, proof and versioned hash
pub fn encode_blob(data: &[u8]) -> BlobResult<BlobCommitment> {
    let packed = pack_blob(data)?;
    let settings = kzg_settings();

    let blob = Blob::from_bytes(packed.as_slice()).map_err(|e| kzg_error("blob", e))?;
    let commitment = KzgCommitment::blob_to_kzg_commitment(&blob, settings)
        .map_err(|e| kzg_error("commitment", e))?;
    let commitment_bytes = commitment.to_bytes();
    let proof = KzgProof::compute_blob_kzg_proof(&blob, &commitment_bytes, settings)
        .map_err(|e| kzg_error("proof", e))?;

    let mut commitment_arr = [0u8; 48];
    commitment_arr.copy_from_slice(commitment_bytes.as_slice());
    let mut proof_arr = [0u8; 48];
    proof_arr.copy_from_slice(proof.to_bytes().as_slice());

    Ok(BlobCommitment {
        versioned_hash: kzg_to_versioned_hash(&commitment_arr),
        blob: packed,
        commitment: commitment_arr,
        proof: proof_arr,
        data_len: data.len(),
    })
}

impl BlobCommitment {
    /// Payload bytes recovered from the packed blob
    pub fn data(&self) -> Vec<u8> {
        decode_blob(&self.blob, self.data_len)
    }

    /// Check the proof against the blob and commitment
    pub fn verify(&self) -> BlobResult<bool> {
        let blob = Blob::from_bytes(self.blob.as_slice()).map_err(|e| kzg_error("blob", e))?;
        let commitment =
            Bytes48::from_bytes(&self.commitment).map_err(|e| kzg_error("commitment", e))?;
        let proof = Bytes48::from_bytes(&self.proof).map_err(|e| kzg_error("proof", e))?;
        KzgProof::verify_blob_kzg_proof(&blob, &commitment, &proof, kzg_settings())
            .map_err(|e| kzg_error("verify", e))
    }
}

/// Several blobs destined for a single transaction
#[derive(Debug, Clone, Default)]
pub struct BlobSidecar {
    pub blobs: Vec<BlobCommitment>,
}

impl BlobSidecar {
    /// Encode each payload into its own blob
    pub fn from_payloads<I, B>(payloads: I) -> BlobResult<Self>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let blobs = payloads
            .into_iter()
            .map(|p| encode_blob(p.as_ref()))
            .collect::<BlobResult<Vec<_>>>()?;
        Ok(Self { blobs })
    }

    pub fn versioned_hashes(&self) -> Vec<TxHash> {
        self.blobs.iter().map(|b| b.versioned_hash).collect()
    }
}
