use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::empty_tree::empty_tree;
use crate::node::{bit_index, branch_hash, ComputedNode, Leaf, MAX_TREE_LEVELS};
use crate::TreeError;

/// A merkle (non-)inclusion proof: one sibling per tree level, ordered from
/// the root down to the leaf. Non-membership is proven by verifying the
/// empty leaf against the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Sibling nodes, root-to-leaf.
    pub nodes: Vec<ComputedNode>,
}

impl Proof {
    /// Creates a proof from the given siblings, which must number exactly
    /// one per tree level.
    pub fn new(nodes: Vec<ComputedNode>) -> Result<Self, TreeError> {
        if nodes.len() != MAX_TREE_LEVELS {
            return Err(TreeError::InvalidProofLength(nodes.len()));
        }
        Ok(Proof { nodes })
    }

    /// Recomputes the root committed to by this proof for the given key and
    /// leaf.
    pub fn root(&self, key: &[u8; 32], leaf: &Leaf) -> Result<ComputedNode, TreeError> {
        let mut hash = leaf.hash();
        let mut sum = leaf.sum;

        for height in (0..MAX_TREE_LEVELS).rev() {
            let sibling = &self.nodes[height];
            let (l_hash, l_sum, r_hash, r_sum) = if bit_index(height, key) == 0 {
                (&hash, sum, &sibling.hash, sibling.sum)
            } else {
                (&sibling.hash, sibling.sum, &hash, sum)
            };
            let parent_sum = l_sum
                .checked_add(r_sum)
                .ok_or(TreeError::IntegerOverflow)?;
            hash = branch_hash(l_hash, l_sum, r_hash, r_sum);
            sum = parent_sum;
        }

        Ok(ComputedNode { hash, sum })
    }

    /// Returns true if the proof binds `(key, leaf)` to `root` by both hash
    /// and sum.
    pub fn verify(&self, key: &[u8; 32], leaf: &Leaf, root: &ComputedNode) -> bool {
        match self.root(key, leaf) {
            Ok(computed) => computed.hash == root.hash && computed.sum == root.sum,
            Err(_) => false,
        }
    }

    /// Compresses the proof by eliding siblings that equal the empty
    /// subtree at their level.
    pub fn compress(&self) -> CompressedProof {
        let mut bits = Vec::with_capacity(MAX_TREE_LEVELS);
        let mut nodes = Vec::new();
        for (height, node) in self.nodes.iter().enumerate() {
            if node.hash == empty_tree()[height + 1].hash {
                bits.push(true);
            } else {
                bits.push(false);
                nodes.push(*node);
            }
        }
        CompressedProof { bits, nodes }
    }
}

/// The wire form of a [`Proof`]: explicit non-empty siblings plus a bit
/// vector marking the elided empty ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedProof {
    /// One bit per level, root-to-leaf; a set bit means the sibling at that
    /// level is the empty subtree.
    pub bits: Vec<bool>,
    /// The non-empty siblings, root-to-leaf.
    pub nodes: Vec<ComputedNode>,
}

impl CompressedProof {
    /// Expands the compressed proof, validating its shape.
    pub fn decompress(&self) -> Result<Proof, TreeError> {
        if self.bits.len() != MAX_TREE_LEVELS {
            return Err(TreeError::InvalidCompressedProof(format!(
                "bit vector length {}, expected {}",
                self.bits.len(),
                MAX_TREE_LEVELS
            )));
        }

        let expected_nodes = self.bits.iter().filter(|bit| !**bit).count();
        if expected_nodes != self.nodes.len() {
            return Err(TreeError::InvalidCompressedProof(format!(
                "{} explicit nodes for {} unset bits",
                self.nodes.len(),
                expected_nodes
            )));
        }

        let mut nodes = Vec::with_capacity(MAX_TREE_LEVELS);
        let mut explicit = self.nodes.iter();
        for (height, bit) in self.bits.iter().enumerate() {
            if *bit {
                nodes.push(empty_tree()[height + 1]);
            } else {
                // Length already validated above.
                let node = explicit.next().ok_or_else(|| {
                    TreeError::InvalidCompressedProof("explicit node underrun".into())
                })?;
                nodes.push(*node);
            }
        }

        Proof::new(nodes)
    }

    /// Encodes the proof into its wire form: a big-endian u16 sibling count,
    /// each sibling as `hash(32) || sum_be64(8)`, then the packed bit
    /// vector (LSB-first within each byte).
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<(), TreeError> {
        let count = self.nodes.len() as u16;
        w.write_all(&count.to_be_bytes())
            .map_err(|e| TreeError::Store(e.to_string()))?;

        for node in &self.nodes {
            w.write_all(&node.hash)
                .map_err(|e| TreeError::Store(e.to_string()))?;
            w.write_all(&node.sum.to_be_bytes())
                .map_err(|e| TreeError::Store(e.to_string()))?;
        }

        w.write_all(&pack_bits(&self.bits))
            .map_err(|e| TreeError::Store(e.to_string()))?;
        Ok(())
    }

    /// Decodes a proof from its wire form.
    pub fn decode<R: Read>(r: &mut R) -> Result<Self, TreeError> {
        let mut count_bytes = [0u8; 2];
        r.read_exact(&mut count_bytes)
            .map_err(|e| TreeError::InvalidCompressedProof(e.to_string()))?;
        let count = u16::from_be_bytes(count_bytes) as usize;
        if count > MAX_TREE_LEVELS {
            return Err(TreeError::InvalidCompressedProof(format!(
                "{count} siblings exceeds tree depth"
            )));
        }

        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            let mut hash = [0u8; 32];
            r.read_exact(&mut hash)
                .map_err(|e| TreeError::InvalidCompressedProof(e.to_string()))?;
            let mut sum_bytes = [0u8; 8];
            r.read_exact(&mut sum_bytes)
                .map_err(|e| TreeError::InvalidCompressedProof(e.to_string()))?;
            nodes.push(ComputedNode {
                hash,
                sum: u64::from_be_bytes(sum_bytes),
            });
        }

        let mut packed = [0u8; MAX_TREE_LEVELS / 8];
        r.read_exact(&mut packed)
            .map_err(|e| TreeError::InvalidCompressedProof(e.to_string()))?;
        let bits = unpack_bits(&packed);

        let proof = CompressedProof { bits, nodes };
        // Reject structurally inconsistent proofs eagerly.
        proof.decompress()?;
        Ok(proof)
    }
}

/// Packs bits into bytes, LSB-first within each byte.
fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; (bits.len() + 7) / 8];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpacks bytes into bits, LSB-first within each byte.
fn unpack_bits(bytes: &[u8]) -> Vec<bool> {
    let mut bits = Vec::with_capacity(bytes.len() * 8);
    for i in 0..bytes.len() * 8 {
        bits.push((bytes[i / 8] >> (i % 8)) & 1 == 1);
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::tree::{FullTree, Tree};

    fn populated_tree() -> FullTree<MemoryStore> {
        let mut tree = FullTree::new(MemoryStore::new());
        for i in 0u8..5 {
            tree.insert(&[i; 32], Leaf::new(vec![i], (i as u64 + 1) * 10))
                .unwrap();
        }
        tree
    }

    #[test]
    fn compress_round_trip() {
        let tree = populated_tree();
        let proof = tree.merkle_proof(&[2; 32]).unwrap();

        let compressed = proof.compress();
        assert_eq!(compressed.decompress().unwrap(), proof);
    }

    #[test]
    fn wire_round_trip() {
        let tree = populated_tree();
        let proof = tree.merkle_proof(&[3; 32]).unwrap();
        let compressed = proof.compress();

        let mut buf = Vec::new();
        compressed.encode(&mut buf).unwrap();
        let decoded = CompressedProof::decode(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, compressed);
        assert_eq!(decoded.decompress().unwrap(), proof);
    }

    #[test]
    fn bit_node_mismatch_rejected() {
        let tree = populated_tree();
        let mut compressed = tree.merkle_proof(&[1; 32]).unwrap().compress();
        compressed.nodes.pop();
        assert!(matches!(
            compressed.decompress(),
            Err(TreeError::InvalidCompressedProof(_))
        ));
    }

    #[test]
    fn truncated_wire_rejected() {
        let tree = populated_tree();
        let compressed = tree.merkle_proof(&[1; 32]).unwrap().compress();
        let mut buf = Vec::new();
        compressed.encode(&mut buf).unwrap();
        buf.truncate(buf.len() - 1);
        assert!(CompressedProof::decode(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn short_proof_rejected() {
        assert!(matches!(
            Proof::new(vec![ComputedNode {
                hash: [0; 32],
                sum: 0
            }]),
            Err(TreeError::InvalidProofLength(1))
        ));
    }
}
