//! The Taro asset model.
//!
//! An asset is born at a genesis event, carries a linked chain of witnesses
//! back to that genesis, and is addressed inside commitment trees by two
//! deterministic keys: the asset-commitment key (a digest of its script key)
//! and the Taro-commitment key (the group key digest for grouped assets, the
//! asset id otherwise).

mod asset;
mod error;
mod keys;
mod tapscript;
pub mod tlv;

pub use asset::{
    Asset, AssetId, AssetType, AssetVersion, Genesis, GroupKey, PrevId, SplitCommitment, Witness,
};
pub use error::AssetError;
pub use keys::{ScriptKey, SerializedKey, NUMS_KEY_BYTES};
pub use tapscript::{TapBranch, TapLeaf, TapscriptTreeManager, TapscriptTreeNodes};

use bitcoin::hashes::Hash;
use bitcoin::key::TweakedPublicKey;
use bitcoin::secp256k1::schnorr::Signature;
use bitcoin::secp256k1::Message;
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::{absolute, transaction, Amount, ScriptBuf, Transaction, TxIn, TxOut};

/// Signs the virtual genesis transaction that authorizes membership of a new
/// asset in an asset group. Implemented by the wallet collaborator.
pub trait GenesisSigner {
    /// Produces a schnorr signature over the virtual genesis transaction.
    fn sign_virtual_tx(
        &self,
        group_key: &GroupKey,
        tx: &Transaction,
        prev_out: &TxOut,
    ) -> Result<Signature, AssetError>;
}

/// Builds the deterministic virtual transaction representing the genesis
/// state transition of a grouped asset.
pub trait GenesisTxBuilder {
    /// Constructs the virtual transaction and previous output that together
    /// form the message the group witness signs.
    fn build_genesis_tx(&self, new_asset: &Asset) -> Result<(Transaction, TxOut), AssetError>;
}

/// The canonical [`GenesisTxBuilder`]: a one-input, one-output transaction
/// spending the genesis prevout into a P2TR output of the tweaked group key.
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtualGenesisTxBuilder;

impl GenesisTxBuilder for VirtualGenesisTxBuilder {
    fn build_genesis_tx(&self, new_asset: &Asset) -> Result<(Transaction, TxOut), AssetError> {
        let group = new_asset
            .group_key
            .as_ref()
            .ok_or_else(|| AssetError::InvalidAsset("asset has no group key".into()))?;

        let (xonly, _) = group.group_pub_key.x_only_public_key();
        let script_pubkey =
            ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(xonly));
        let prev_out = TxOut {
            value: Amount::ZERO,
            script_pubkey: script_pubkey.clone(),
        };

        let tx = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: new_asset.genesis.first_prev_out,
                script_sig: ScriptBuf::new(),
                sequence: bitcoin::Sequence::MAX,
                witness: bitcoin::Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::ZERO,
                script_pubkey,
            }],
        };

        Ok((tx, prev_out))
    }
}

/// Computes the taproot key-spend sighash the group witness signs.
pub fn genesis_tx_digest(tx: &Transaction, prev_out: &TxOut) -> Result<Message, AssetError> {
    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .taproot_key_spend_signature_hash(
            0,
            &Prevouts::All(&[prev_out.clone()]),
            TapSighashType::Default,
        )
        .map_err(|e| AssetError::BitcoinSerialization(e.to_string()))?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}
