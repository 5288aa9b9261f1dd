use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::secp256k1::{PublicKey, Scalar, Secp256k1, Verification, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::asset::PrevId;
use crate::AssetError;

/// The published NUMS ("nothing up my sleeve") point. Tombstone and burn
/// script keys are derived from it, so nobody can ever produce a signature
/// for them.
pub const NUMS_KEY_BYTES: [u8; 33] = [
    0x02, 0x7c, 0x79, 0xb9, 0xb2, 0x6e, 0x46, 0x38, 0x95, 0xee, 0xf5, 0x67, 0x9d, 0x85, 0x58,
    0x94, 0x2c, 0x86, 0xc4, 0xad, 0x22, 0x33, 0xad, 0xef, 0x01, 0xbc, 0x3e, 0x6d, 0x54, 0x0b,
    0x36, 0x53, 0xfe,
];

/// A compressed public key in its 33-byte serialized form, usable as a map
/// key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SerializedKey {
    /// The serialized compressed key bytes.
    #[serde(with = "BigArray")]
    pub bytes: [u8; 33],
}

impl SerializedKey {
    /// Serializes a public key.
    pub fn from_pub_key(key: &PublicKey) -> Self {
        SerializedKey {
            bytes: key.serialize(),
        }
    }

    /// Returns the x-only portion of the key.
    pub fn x_only(&self) -> [u8; 32] {
        let mut xonly = [0u8; 32];
        xonly.copy_from_slice(&self.bytes[1..]);
        xonly
    }

    /// Parses the serialized bytes back into a public key.
    pub fn parse(&self) -> Result<PublicKey, AssetError> {
        PublicKey::from_slice(&self.bytes).map_err(|e| AssetError::InvalidKey(e.to_string()))
    }
}

impl AsRef<[u8]> for SerializedKey {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// A Taproot script key controlling an asset. For keys the local wallet
/// derived, the pre-tweak internal key is retained so the output remains
/// spendable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScriptKey {
    /// The tweaked, externally visible key.
    pub pub_key: PublicKey,
    /// The raw internal key the tweak was applied to, when known.
    pub raw_internal_key: Option<PublicKey>,
}

impl ScriptKey {
    /// Wraps an already-tweaked public key.
    pub fn new(pub_key: PublicKey) -> Self {
        ScriptKey {
            pub_key,
            raw_internal_key: None,
        }
    }

    /// Derives a BIP-86 script key: the internal key tweaked with an empty
    /// tapscript tree.
    pub fn bip86<C: Verification>(
        secp: &Secp256k1<C>,
        internal: PublicKey,
    ) -> Result<Self, AssetError> {
        let (xonly, _) = internal.x_only_public_key();
        let tweak = bitcoin::taproot::TapTweakHash::from_key_and_tweak(xonly, None);
        let scalar = Scalar::from_be_bytes(tweak.to_byte_array())
            .map_err(|e| AssetError::InvalidKey(e.to_string()))?;
        let tweaked = internal
            .add_exp_tweak(secp, &scalar)
            .map_err(|e| AssetError::InvalidKey(e.to_string()))?;
        Ok(ScriptKey {
            pub_key: tweaked,
            raw_internal_key: Some(internal),
        })
    }

    /// The tombstone key: the bare NUMS point. Used for zero-value assets
    /// left behind by non-interactive splits without change.
    pub fn tombstone() -> Self {
        ScriptKey {
            // The constant is a valid compressed point.
            pub_key: nums_key(),
            raw_internal_key: None,
        }
    }

    /// Derives the burn key for the given first previous input: the NUMS
    /// point tweaked with a digest of the spent asset's identity. Assets
    /// sent to this key are provably unspendable.
    pub fn burn<C: Verification>(
        secp: &Secp256k1<C>,
        first_prev_id: &PrevId,
    ) -> Result<Self, AssetError> {
        let tweak = burn_tweak(first_prev_id);
        let scalar = Scalar::from_be_bytes(tweak)
            .map_err(|e| AssetError::InvalidKey(e.to_string()))?;
        let pub_key = nums_key()
            .add_exp_tweak(secp, &scalar)
            .map_err(|e| AssetError::InvalidKey(e.to_string()))?;
        Ok(ScriptKey {
            pub_key,
            raw_internal_key: None,
        })
    }

    /// The x-only form of the tweaked key.
    pub fn x_only(&self) -> XOnlyPublicKey {
        self.pub_key.x_only_public_key().0
    }

    /// The 33-byte serialized form of the tweaked key.
    pub fn serialize(&self) -> SerializedKey {
        SerializedKey::from_pub_key(&self.pub_key)
    }

    /// Returns true if this is the tombstone key.
    pub fn is_tombstone(&self) -> bool {
        self.pub_key.serialize() == NUMS_KEY_BYTES
    }

    /// Returns true if this key is the burn key for the given previous
    /// input.
    pub fn is_burn_for<C: Verification>(&self, secp: &Secp256k1<C>, prev_id: &PrevId) -> bool {
        match ScriptKey::burn(secp, prev_id) {
            Ok(burn) => burn.pub_key == self.pub_key,
            Err(_) => false,
        }
    }
}

/// Returns the NUMS point as a parsed key.
fn nums_key() -> PublicKey {
    // The constant is a valid point; parsing it cannot fail.
    PublicKey::from_slice(&NUMS_KEY_BYTES).unwrap_or_else(|_| unreachable!("static NUMS key"))
}

/// The burn tweak for a previous input:
/// `SHA256(out_point || asset_id || script_key)`.
fn burn_tweak(prev_id: &PrevId) -> [u8; 32] {
    let mut engine = sha256::Hash::engine();
    engine.input(&bitcoin::consensus::encode::serialize(&prev_id.out_point));
    engine.input(prev_id.asset_id.as_ref());
    engine.input(&prev_id.script_key.bytes);
    sha256::Hash::from_engine(engine).to_byte_array()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::sha256;
    use bitcoin::OutPoint;

    fn test_prev_id() -> PrevId {
        PrevId {
            out_point: OutPoint::null(),
            asset_id: sha256::Hash::hash(b"asset"),
            script_key: SerializedKey {
                bytes: NUMS_KEY_BYTES,
            },
        }
    }

    #[test]
    fn tombstone_is_nums() {
        let key = ScriptKey::tombstone();
        assert!(key.is_tombstone());
        assert_eq!(key.serialize().bytes, NUMS_KEY_BYTES);
    }

    #[test]
    fn burn_key_is_deterministic_and_not_tombstone() {
        let secp = Secp256k1::verification_only();
        let prev_id = test_prev_id();

        let a = ScriptKey::burn(&secp, &prev_id).unwrap();
        let b = ScriptKey::burn(&secp, &prev_id).unwrap();
        assert_eq!(a, b);
        assert!(!a.is_tombstone());
        assert!(a.is_burn_for(&secp, &prev_id));

        let mut other = prev_id;
        other.out_point.vout = 1;
        assert!(!a.is_burn_for(&secp, &other));
    }

    #[test]
    fn serialized_key_round_trip() {
        let key = ScriptKey::tombstone().serialize();
        assert_eq!(key.parse().unwrap().serialize(), NUMS_KEY_BYTES);
        assert_eq!(key.x_only().as_slice(), &NUMS_KEY_BYTES[1..]);
    }
}
