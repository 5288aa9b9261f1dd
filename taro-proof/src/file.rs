use std::io::{Read, Write};

use bitcoin::hashes::{sha256, Hash, HashEngine};
use serde::{Deserialize, Serialize};
use taro_asset::tlv;

use crate::records::Proof;
use crate::ProofError;

/// Magic bytes prefixing a proof file ("TAPF").
pub const FILE_MAGIC_BYTES: [u8; 4] = [0x54, 0x41, 0x50, 0x46];

/// Version of proof files produced by this crate.
const FILE_VERSION: u32 = 0;

/// Maximum number of proofs in one file.
const FILE_MAX_NUM_PROOFS: u64 = 420_000;
/// Maximum size of a single encoded proof.
const FILE_MAX_PROOF_SIZE_BYTES: u64 = 128 * 1024 * 1024;

/// One encoded proof with its chained checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct HashedProof {
    proof_bytes: Vec<u8>,
    hash: [u8; 32],
}

/// An ordered chain of encoded proofs. Every entry carries
/// `SHA256(prev_hash || proof_bytes)`, so the last hash is a digest over the
/// whole file and any truncation or reordering is detectable.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct File {
    version: u32,
    proofs: Vec<HashedProof>,
}

impl File {
    /// Creates an empty proof file.
    pub fn new() -> Self {
        File {
            version: FILE_VERSION,
            proofs: Vec::new(),
        }
    }

    /// Creates a proof file from an ordered list of proofs.
    pub fn from_proofs(
        proofs: impl IntoIterator<Item = Proof>,
    ) -> Result<Self, ProofError> {
        let mut file = File::new();
        for proof in proofs {
            file.append(&proof)?;
        }
        Ok(file)
    }

    /// Appends a proof to the end of the chain.
    pub fn append(&mut self, proof: &Proof) -> Result<(), ProofError> {
        let proof_bytes = proof.to_bytes()?;
        self.append_raw(proof_bytes)
    }

    /// Appends an already-encoded proof to the end of the chain.
    pub fn append_raw(&mut self, proof_bytes: Vec<u8>) -> Result<(), ProofError> {
        if self.proofs.len() as u64 >= FILE_MAX_NUM_PROOFS {
            return Err(ProofError::InvalidProof("proof file full".into()));
        }

        let prev_hash = self
            .proofs
            .last()
            .map(|p| p.hash)
            .unwrap_or([0u8; 32]);
        let hash = hash_proof(&prev_hash, &proof_bytes);
        self.proofs.push(HashedProof { proof_bytes, hash });
        Ok(())
    }

    /// Returns true if the file holds no proofs.
    pub fn is_empty(&self) -> bool {
        self.proofs.is_empty()
    }

    /// The number of proofs in the file.
    pub fn num_proofs(&self) -> usize {
        self.proofs.len()
    }

    /// Decodes the proof at `index`.
    pub fn proof_at(&self, index: usize) -> Result<Proof, ProofError> {
        let entry = self
            .proofs
            .get(index)
            .ok_or_else(|| ProofError::InvalidProof(format!("no proof at index {index}")))?;
        Proof::from_bytes(&entry.proof_bytes)
    }

    /// Decodes the newest proof in the chain.
    pub fn last_proof(&self) -> Result<Proof, ProofError> {
        if self.is_empty() {
            return Err(ProofError::InvalidProof("proof file is empty".into()));
        }
        self.proof_at(self.proofs.len() - 1)
    }

    /// The raw bytes of the newest proof in the chain.
    pub fn raw_last_proof(&self) -> Result<&[u8], ProofError> {
        self.proofs
            .last()
            .map(|p| p.proof_bytes.as_slice())
            .ok_or_else(|| ProofError::InvalidProof("proof file is empty".into()))
    }

    /// The chained digest over the whole file.
    pub fn digest(&self) -> [u8; 32] {
        self.proofs.last().map(|p| p.hash).unwrap_or([0u8; 32])
    }

    /// Encodes the file: magic, version, then each proof length-prefixed and
    /// followed by its chained checksum.
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<(), ProofError> {
        let io_err = |e: std::io::Error| ProofError::InvalidProof(e.to_string());

        w.write_all(&FILE_MAGIC_BYTES).map_err(io_err)?;
        w.write_all(&self.version.to_be_bytes()).map_err(io_err)?;
        tlv::write_varint(w, self.proofs.len() as u64)
            .map_err(|e| ProofError::InvalidProof(e.to_string()))?;

        for proof in &self.proofs {
            tlv::write_varint(w, proof.proof_bytes.len() as u64)
                .map_err(|e| ProofError::InvalidProof(e.to_string()))?;
            w.write_all(&proof.proof_bytes).map_err(io_err)?;
            w.write_all(&proof.hash).map_err(io_err)?;
        }
        Ok(())
    }

    /// Encodes the file into a fresh byte vector.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProofError> {
        let mut bytes = Vec::new();
        self.encode(&mut bytes)?;
        Ok(bytes)
    }

    /// Decodes a proof file, verifying every chained checksum.
    pub fn decode<R: Read>(r: &mut R) -> Result<Self, ProofError> {
        let io_err = |e: std::io::Error| ProofError::InvalidProof(e.to_string());

        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).map_err(io_err)?;
        if magic != FILE_MAGIC_BYTES {
            return Err(ProofError::InvalidProof(format!(
                "bad file magic {magic:02x?}"
            )));
        }

        let mut version = [0u8; 4];
        r.read_exact(&mut version).map_err(io_err)?;
        let version = u32::from_be_bytes(version);

        let num_proofs =
            tlv::read_varint(r).map_err(|e| ProofError::InvalidProof(e.to_string()))?;
        if num_proofs > FILE_MAX_NUM_PROOFS {
            return Err(ProofError::InvalidProof(format!(
                "too many proofs in file: {num_proofs}"
            )));
        }

        let mut proofs = Vec::with_capacity(num_proofs as usize);
        let mut prev_hash = [0u8; 32];
        for _ in 0..num_proofs {
            let proof_size =
                tlv::read_varint(r).map_err(|e| ProofError::InvalidProof(e.to_string()))?;
            if proof_size > FILE_MAX_PROOF_SIZE_BYTES {
                return Err(ProofError::InvalidProof(format!(
                    "proof too large: {proof_size} bytes"
                )));
            }

            let mut proof_bytes = vec![0u8; proof_size as usize];
            r.read_exact(&mut proof_bytes).map_err(io_err)?;

            let mut hash = [0u8; 32];
            r.read_exact(&mut hash).map_err(io_err)?;

            if hash != hash_proof(&prev_hash, &proof_bytes) {
                return Err(ProofError::InvalidProof(
                    "proof file checksum mismatch".into(),
                ));
            }

            prev_hash = hash;
            proofs.push(HashedProof { proof_bytes, hash });
        }

        Ok(File { version, proofs })
    }

    /// Decodes a proof file from a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProofError> {
        let mut reader = bytes;
        Self::decode(&mut reader)
    }
}

/// Chained proof checksum: `SHA256(prev_hash || proof_bytes)`.
fn hash_proof(prev_hash: &[u8; 32], proof_bytes: &[u8]) -> [u8; 32] {
    let mut engine = sha256::Hash::engine();
    engine.input(prev_hash);
    engine.input(proof_bytes);
    sha256::Hash::from_engine(engine).to_byte_array()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_round_trip() {
        let file = File::new();
        let bytes = file.to_bytes().unwrap();
        assert_eq!(File::from_bytes(&bytes).unwrap(), file);
    }

    #[test]
    fn append_chains_hashes() {
        let mut file = File::new();
        file.append_raw(vec![1, 2, 3]).unwrap();
        let first = file.digest();
        file.append_raw(vec![4, 5, 6]).unwrap();
        assert_ne!(file.digest(), first);
        assert_eq!(file.num_proofs(), 2);
    }

    #[test]
    fn corrupted_checksum_rejected() {
        let mut file = File::new();
        file.append_raw(vec![1, 2, 3]).unwrap();
        file.append_raw(vec![4, 5, 6]).unwrap();
        let mut bytes = file.to_bytes().unwrap();

        // Flip one byte of the first proof body.
        let position = FILE_MAGIC_BYTES.len() + 4 + 1 + 1;
        bytes[position] ^= 0xFF;
        assert!(matches!(
            File::from_bytes(&bytes),
            Err(ProofError::InvalidProof(_))
        ));
    }

    #[test]
    fn raw_round_trip() {
        let mut file = File::new();
        file.append_raw(b"first".to_vec()).unwrap();
        file.append_raw(b"second".to_vec()).unwrap();

        let decoded = File::from_bytes(&file.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, file);
        assert_eq!(decoded.raw_last_proof().unwrap(), b"second");
    }
}
