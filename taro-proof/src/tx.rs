use std::io::{Read, Write};

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::{Transaction, TxMerkleNode, Txid};
use serde::{Deserialize, Serialize};

use taro_asset::tlv;

use crate::ProofError;

/// Upper bound on merkle proof depth; far beyond any real block.
const MERKLE_PROOF_MAX_NODES: u64 = 512;

/// A proof that a transaction is included under a block header's merkle
/// root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxMerkleProof {
    /// Sibling hashes along the path from the transaction to the root.
    pub nodes: Vec<TxMerkleNode>,
    /// Direction bits per sibling: `true` places the sibling on the right.
    pub bits: Vec<bool>,
}

impl TxMerkleProof {
    /// Builds the merkle proof for the transaction at `tx_index` within the
    /// given block transaction list.
    pub fn from_block_txids(txids: &[Txid], tx_index: usize) -> Result<Self, ProofError> {
        if tx_index >= txids.len() {
            return Err(ProofError::InvalidProof(format!(
                "tx index {tx_index} out of range for {} transactions",
                txids.len()
            )));
        }

        let mut layer: Vec<[u8; 32]> = txids.iter().map(|id| id.to_byte_array()).collect();
        let mut index = tx_index;
        let mut nodes = Vec::new();
        let mut bits = Vec::new();

        while layer.len() > 1 {
            // Odd layers duplicate their last element, per bitcoin's merkle
            // tree construction.
            if layer.len() % 2 == 1 {
                let last = layer[layer.len() - 1];
                layer.push(last);
            }

            let sibling_index = index ^ 1;
            nodes.push(TxMerkleNode::from_byte_array(layer[sibling_index]));
            // Even path index means our node is on the left, so the sibling
            // sits on the right.
            bits.push(index % 2 == 0);

            let mut next = Vec::with_capacity(layer.len() / 2);
            for pair in layer.chunks(2) {
                next.push(hash_pair(pair[0], pair[1]));
            }
            layer = next;
            index /= 2;
        }

        Ok(TxMerkleProof { nodes, bits })
    }

    /// Verifies the proof binds `tx` to `merkle_root`.
    pub fn verify(&self, tx: &Transaction, merkle_root: TxMerkleNode) -> bool {
        if self.nodes.len() != self.bits.len() {
            return false;
        }

        let mut current = tx.compute_txid().to_byte_array();
        for (node, sibling_on_right) in self.nodes.iter().zip(self.bits.iter()) {
            let sibling = node.to_byte_array();
            current = if *sibling_on_right {
                hash_pair(current, sibling)
            } else {
                hash_pair(sibling, current)
            };
        }

        current == merkle_root.to_byte_array()
    }

    /// Encodes the proof: varint node count, the nodes, then the direction
    /// bits packed LSB-first.
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<(), ProofError> {
        tlv::write_varint(w, self.nodes.len() as u64)
            .map_err(|e| ProofError::InvalidProof(e.to_string()))?;
        for node in &self.nodes {
            w.write_all(&node.to_byte_array())
                .map_err(|e| ProofError::InvalidProof(e.to_string()))?;
        }

        let mut packed = vec![0u8; (self.bits.len() + 7) / 8];
        for (i, bit) in self.bits.iter().enumerate() {
            if *bit {
                packed[i / 8] |= 1 << (i % 8);
            }
        }
        w.write_all(&packed)
            .map_err(|e| ProofError::InvalidProof(e.to_string()))?;
        Ok(())
    }

    /// Decodes a proof from its wire form.
    pub fn decode<R: Read>(r: &mut R) -> Result<Self, ProofError> {
        let num_nodes = tlv::read_varint(r).map_err(|e| ProofError::InvalidProof(e.to_string()))?;
        if num_nodes > MERKLE_PROOF_MAX_NODES {
            return Err(ProofError::InvalidProof(format!(
                "merkle proof has too many nodes: {num_nodes}"
            )));
        }

        let mut nodes = Vec::with_capacity(num_nodes as usize);
        for _ in 0..num_nodes {
            let mut hash = [0u8; 32];
            r.read_exact(&mut hash)
                .map_err(|e| ProofError::InvalidProof(e.to_string()))?;
            nodes.push(TxMerkleNode::from_byte_array(hash));
        }

        let mut packed = vec![0u8; (num_nodes as usize + 7) / 8];
        r.read_exact(&mut packed)
            .map_err(|e| ProofError::InvalidProof(e.to_string()))?;

        let mut bits = Vec::with_capacity(num_nodes as usize);
        for i in 0..num_nodes as usize {
            bits.push((packed[i / 8] >> (i % 8)) & 1 == 1);
        }

        Ok(TxMerkleProof { nodes, bits })
    }
}

fn hash_pair(left: [u8; 32], right: [u8; 32]) -> [u8; 32] {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(&left);
    buf[32..].copy_from_slice(&right);
    sha256d::Hash::hash(&buf).to_byte_array()
}
