//! Deterministic wire codec for virtual packets, used when a parcel is
//! persisted or handed to a signing collaborator.

use std::io::{Read, Write};

use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::PublicKey;
use bitcoin::OutPoint;
use taro_asset::tlv::{self, Stream, Type};
use taro_asset::{Asset, PrevId, ScriptKey, SerializedKey};
use taro_commitment::TapscriptPreimage;

use crate::packet::{InputAnchor, KeyDescriptor, OutputType, VInput, VOutput, VPacket};
use crate::VPacketError;

const PACKET_INPUTS_TYPE: Type = Type(0);
const PACKET_OUTPUTS_TYPE: Type = Type(2);

const INPUT_PREV_ID_TYPE: Type = Type(0);
const INPUT_ASSET_TYPE: Type = Type(2);
const INPUT_ANCHOR_TYPE: Type = Type(4);

const OUTPUT_AMOUNT_TYPE: Type = Type(0);
const OUTPUT_TYPE_TYPE: Type = Type(2);
const OUTPUT_INTERACTIVE_TYPE: Type = Type(4);
const OUTPUT_ANCHOR_INDEX_TYPE: Type = Type(6);
const OUTPUT_ANCHOR_KEY_TYPE: Type = Type(8);
const OUTPUT_SCRIPT_KEY_TYPE: Type = Type(10);
const OUTPUT_ASSET_TYPE: Type = Type(12);
const OUTPUT_ANCHOR_KEY_DESC_TYPE: Type = Type(14);
const OUTPUT_ANCHOR_SIBLING_TYPE: Type = Type(16);

fn enc_err(e: impl std::fmt::Display) -> VPacketError {
    VPacketError::Encoding(e.to_string())
}

impl VPacket {
    /// Encodes the packet as a TLV stream.
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<(), VPacketError> {
        let mut inputs = Vec::new();
        tlv::write_varint(&mut inputs, self.inputs.len() as u64).map_err(enc_err)?;
        for input in &self.inputs {
            let mut bytes = Vec::new();
            encode_input(&mut bytes, input)?;
            tlv::write_var_bytes(&mut inputs, &bytes).map_err(enc_err)?;
        }
        tlv::write_record(w, PACKET_INPUTS_TYPE, &inputs).map_err(enc_err)?;

        let mut outputs = Vec::new();
        tlv::write_varint(&mut outputs, self.outputs.len() as u64).map_err(enc_err)?;
        for output in &self.outputs {
            let mut bytes = Vec::new();
            encode_output(&mut bytes, output)?;
            tlv::write_var_bytes(&mut outputs, &bytes).map_err(enc_err)?;
        }
        tlv::write_record(w, PACKET_OUTPUTS_TYPE, &outputs).map_err(enc_err)?;

        Ok(())
    }

    /// Encodes the packet into a fresh byte vector.
    pub fn to_bytes(&self) -> Result<Vec<u8>, VPacketError> {
        let mut bytes = Vec::new();
        self.encode(&mut bytes)?;
        Ok(bytes)
    }

    /// Decodes a packet from a TLV stream.
    pub fn decode<R: Read>(r: R) -> Result<Self, VPacketError> {
        let mut stream = Stream::new(r);
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();

        while let Some(record) = stream.next_record().map_err(enc_err)? {
            match record.tlv_type() {
                PACKET_INPUTS_TYPE => {
                    let mut reader = record.value_reader();
                    let count = tlv::read_varint(&mut reader).map_err(enc_err)?;
                    for _ in 0..count {
                        let bytes = tlv::read_var_bytes(&mut reader, 1 << 20).map_err(enc_err)?;
                        inputs.push(decode_input(&bytes)?);
                    }
                }
                PACKET_OUTPUTS_TYPE => {
                    let mut reader = record.value_reader();
                    let count = tlv::read_varint(&mut reader).map_err(enc_err)?;
                    for _ in 0..count {
                        let bytes = tlv::read_var_bytes(&mut reader, 1 << 20).map_err(enc_err)?;
                        outputs.push(decode_output(&bytes)?);
                    }
                }
                other if other.is_odd() => {}
                other => {
                    return Err(VPacketError::Encoding(format!(
                        "unknown even tlv type {}",
                        other.0
                    )))
                }
            }
        }

        Ok(VPacket { inputs, outputs })
    }

    /// Decodes a packet from a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VPacketError> {
        Self::decode(bytes)
    }
}

fn encode_input<W: Write>(w: &mut W, input: &VInput) -> Result<(), VPacketError> {
    let mut prev_id = Vec::with_capacity(36 + 32 + 33);
    prev_id.extend_from_slice(&bitcoin::consensus::encode::serialize(
        &input.prev_id.out_point,
    ));
    prev_id.extend_from_slice(input.prev_id.asset_id.as_ref());
    prev_id.extend_from_slice(&input.prev_id.script_key.bytes);
    tlv::write_record(w, INPUT_PREV_ID_TYPE, &prev_id).map_err(enc_err)?;

    let mut asset = Vec::new();
    input.asset.encode(&mut asset).map_err(enc_err)?;
    tlv::write_record(w, INPUT_ASSET_TYPE, &asset).map_err(enc_err)?;

    let mut anchor = Vec::new();
    anchor.extend_from_slice(&bitcoin::consensus::encode::serialize(
        &input.anchor.out_point,
    ));
    anchor.extend_from_slice(&input.anchor.internal_key.serialize());
    tlv::write_var_bytes(&mut anchor, &input.anchor.pk_script).map_err(enc_err)?;
    anchor.extend_from_slice(&input.anchor.value.to_be_bytes());
    match &input.anchor.tapscript_sibling {
        Some(preimage) => {
            anchor.push(1);
            preimage.encode(&mut anchor).map_err(enc_err)?;
        }
        None => anchor.push(0),
    }
    tlv::write_record(w, INPUT_ANCHOR_TYPE, &anchor).map_err(enc_err)?;

    Ok(())
}

fn decode_input(bytes: &[u8]) -> Result<VInput, VPacketError> {
    let mut stream = Stream::new(bytes);
    let mut prev_id = None;
    let mut asset = None;
    let mut anchor = None;

    while let Some(record) = stream.next_record().map_err(enc_err)? {
        match record.tlv_type() {
            INPUT_PREV_ID_TYPE => {
                let value = record.value();
                if value.len() != 36 + 32 + 33 {
                    return Err(VPacketError::Encoding("bad prev id length".into()));
                }
                let out_point: OutPoint =
                    bitcoin::consensus::encode::deserialize(&value[..36]).map_err(enc_err)?;
                let mut asset_id = [0u8; 32];
                asset_id.copy_from_slice(&value[36..68]);
                let mut key = [0u8; 33];
                key.copy_from_slice(&value[68..]);
                prev_id = Some(PrevId {
                    out_point,
                    asset_id: bitcoin::hashes::sha256::Hash::from_byte_array(asset_id),
                    script_key: SerializedKey { bytes: key },
                });
            }
            INPUT_ASSET_TYPE => {
                asset = Some(Asset::decode(record.value()).map_err(enc_err)?);
            }
            INPUT_ANCHOR_TYPE => {
                anchor = Some(decode_input_anchor(record.value())?);
            }
            other if other.is_odd() => {}
            other => {
                return Err(VPacketError::Encoding(format!(
                    "unknown even tlv type {}",
                    other.0
                )))
            }
        }
    }

    Ok(VInput {
        prev_id: prev_id.ok_or_else(|| VPacketError::Encoding("missing prev id".into()))?,
        asset: asset.ok_or_else(|| VPacketError::Encoding("missing input asset".into()))?,
        anchor: anchor.ok_or_else(|| VPacketError::Encoding("missing input anchor".into()))?,
    })
}

fn decode_input_anchor(bytes: &[u8]) -> Result<InputAnchor, VPacketError> {
    let mut reader = bytes;

    let mut out_point_bytes = [0u8; 36];
    reader.read_exact(&mut out_point_bytes).map_err(enc_err)?;
    let out_point: OutPoint =
        bitcoin::consensus::encode::deserialize(&out_point_bytes).map_err(enc_err)?;

    let mut key = [0u8; 33];
    reader.read_exact(&mut key).map_err(enc_err)?;
    let internal_key = PublicKey::from_slice(&key).map_err(enc_err)?;

    let pk_script = tlv::read_var_bytes(&mut reader, 1 << 16).map_err(enc_err)?;

    let mut value_bytes = [0u8; 8];
    reader.read_exact(&mut value_bytes).map_err(enc_err)?;

    let mut flag = [0u8; 1];
    reader.read_exact(&mut flag).map_err(enc_err)?;
    let tapscript_sibling = if flag[0] == 1 {
        Some(TapscriptPreimage::decode(reader).map_err(enc_err)?)
    } else {
        None
    };

    Ok(InputAnchor {
        out_point,
        internal_key,
        pk_script,
        tapscript_sibling,
        value: u64::from_be_bytes(value_bytes),
    })
}

fn encode_output<W: Write>(w: &mut W, output: &VOutput) -> Result<(), VPacketError> {
    tlv::write_record(w, OUTPUT_AMOUNT_TYPE, &output.amount.to_be_bytes()).map_err(enc_err)?;
    tlv::write_record(w, OUTPUT_TYPE_TYPE, &[output.output_type as u8]).map_err(enc_err)?;
    tlv::write_record(w, OUTPUT_INTERACTIVE_TYPE, &[output.interactive as u8])
        .map_err(enc_err)?;
    tlv::write_record(
        w,
        OUTPUT_ANCHOR_INDEX_TYPE,
        &output.anchor_output_index.to_be_bytes(),
    )
    .map_err(enc_err)?;
    tlv::write_record(
        w,
        OUTPUT_ANCHOR_KEY_TYPE,
        &output.anchor_internal_key.serialize(),
    )
    .map_err(enc_err)?;
    tlv::write_record(
        w,
        OUTPUT_SCRIPT_KEY_TYPE,
        &output.script_key.serialize().bytes,
    )
    .map_err(enc_err)?;

    if let Some(asset) = &output.asset {
        let mut bytes = Vec::new();
        asset.encode(&mut bytes).map_err(enc_err)?;
        tlv::write_record(w, OUTPUT_ASSET_TYPE, &bytes).map_err(enc_err)?;
    }

    if let Some(desc) = &output.anchor_key_desc {
        let mut bytes = Vec::with_capacity(4 + 4 + 33);
        bytes.extend_from_slice(&desc.family.to_be_bytes());
        bytes.extend_from_slice(&desc.index.to_be_bytes());
        bytes.extend_from_slice(&desc.pub_key.serialize());
        tlv::write_record(w, OUTPUT_ANCHOR_KEY_DESC_TYPE, &bytes).map_err(enc_err)?;
    }

    if let Some(preimage) = &output.anchor_tapscript_sibling {
        let mut bytes = Vec::new();
        preimage.encode(&mut bytes).map_err(enc_err)?;
        tlv::write_record(w, OUTPUT_ANCHOR_SIBLING_TYPE, &bytes).map_err(enc_err)?;
    }

    Ok(())
}

fn decode_output(bytes: &[u8]) -> Result<VOutput, VPacketError> {
    let mut stream = Stream::new(bytes);
    let mut amount = None;
    let mut output_type = None;
    let mut interactive = None;
    let mut anchor_output_index = None;
    let mut anchor_internal_key = None;
    let mut script_key = None;
    let mut asset = None;
    let mut anchor_key_desc = None;
    let mut anchor_tapscript_sibling = None;

    while let Some(record) = stream.next_record().map_err(enc_err)? {
        match record.tlv_type() {
            OUTPUT_AMOUNT_TYPE => {
                let value = record.value();
                if value.len() != 8 {
                    return Err(VPacketError::Encoding("amount must be 8 bytes".into()));
                }
                let mut buf = [0u8; 8];
                buf.copy_from_slice(value);
                amount = Some(u64::from_be_bytes(buf));
            }
            OUTPUT_TYPE_TYPE => {
                output_type = Some(match record.value() {
                    [0] => OutputType::Simple,
                    [1] => OutputType::SplitRoot,
                    [2] => OutputType::PassiveAssetsOnly,
                    other => {
                        return Err(VPacketError::Encoding(format!(
                            "unknown output type {other:?}"
                        )))
                    }
                });
            }
            OUTPUT_INTERACTIVE_TYPE => {
                interactive = Some(matches!(record.value(), [1]));
            }
            OUTPUT_ANCHOR_INDEX_TYPE => {
                let value = record.value();
                if value.len() != 4 {
                    return Err(VPacketError::Encoding("anchor index must be 4 bytes".into()));
                }
                anchor_output_index =
                    Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
            }
            OUTPUT_ANCHOR_KEY_TYPE => {
                anchor_internal_key =
                    Some(PublicKey::from_slice(record.value()).map_err(enc_err)?);
            }
            OUTPUT_SCRIPT_KEY_TYPE => {
                let key = PublicKey::from_slice(record.value()).map_err(enc_err)?;
                script_key = Some(ScriptKey::new(key));
            }
            OUTPUT_ASSET_TYPE => {
                asset = Some(Asset::decode(record.value()).map_err(enc_err)?);
            }
            OUTPUT_ANCHOR_KEY_DESC_TYPE => {
                let value = record.value();
                if value.len() != 4 + 4 + 33 {
                    return Err(VPacketError::Encoding("bad key descriptor length".into()));
                }
                anchor_key_desc = Some(KeyDescriptor {
                    family: u32::from_be_bytes([value[0], value[1], value[2], value[3]]),
                    index: u32::from_be_bytes([value[4], value[5], value[6], value[7]]),
                    pub_key: PublicKey::from_slice(&value[8..]).map_err(enc_err)?,
                });
            }
            OUTPUT_ANCHOR_SIBLING_TYPE => {
                anchor_tapscript_sibling =
                    Some(TapscriptPreimage::decode(record.value()).map_err(enc_err)?);
            }
            other if other.is_odd() => {}
            other => {
                return Err(VPacketError::Encoding(format!(
                    "unknown even tlv type {}",
                    other.0
                )))
            }
        }
    }

    Ok(VOutput {
        amount: amount.ok_or_else(|| VPacketError::Encoding("missing amount".into()))?,
        output_type: output_type
            .ok_or_else(|| VPacketError::Encoding("missing output type".into()))?,
        interactive: interactive
            .ok_or_else(|| VPacketError::Encoding("missing interactive flag".into()))?,
        anchor_output_index: anchor_output_index
            .ok_or_else(|| VPacketError::Encoding("missing anchor index".into()))?,
        anchor_internal_key: anchor_internal_key
            .ok_or_else(|| VPacketError::Encoding("missing anchor key".into()))?,
        anchor_key_desc,
        anchor_tapscript_sibling,
        script_key: script_key
            .ok_or_else(|| VPacketError::Encoding("missing script key".into()))?,
        asset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::{sha256, Hash};
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use taro_asset::{AssetType, Genesis};

    fn key(byte: u8) -> PublicKey {
        let secp = Secp256k1::new();
        SecretKey::from_slice(&[byte; 32]).unwrap().public_key(&secp)
    }

    fn sample_packet() -> VPacket {
        let asset = Asset::new_genesis(
            Genesis {
                first_prev_out: OutPoint::null(),
                tag: "wire".into(),
                meta_hash: sha256::Hash::hash(b"wire"),
                output_index: 0,
                asset_type: AssetType::Normal,
            },
            1_000,
            ScriptKey::new(key(1)),
            None,
        )
        .unwrap();

        let mut packet = VPacket {
            inputs: vec![VInput {
                prev_id: PrevId {
                    out_point: OutPoint::null(),
                    asset_id: asset.id(),
                    script_key: asset.script_key.serialize(),
                },
                anchor: InputAnchor {
                    out_point: OutPoint::null(),
                    internal_key: key(2),
                    pk_script: vec![0x51, 0x20],
                    tapscript_sibling: None,
                    value: 10_000,
                },
                asset,
            }],
            outputs: vec![
                VOutput {
                    amount: 600,
                    output_type: OutputType::SplitRoot,
                    interactive: false,
                    anchor_output_index: 0,
                    anchor_internal_key: key(3),
                    anchor_key_desc: Some(KeyDescriptor {
                        family: 212,
                        index: 5,
                        pub_key: key(3),
                    }),
                    anchor_tapscript_sibling: None,
                    script_key: ScriptKey::new(key(4)),
                    asset: None,
                },
                VOutput {
                    amount: 400,
                    output_type: OutputType::Simple,
                    interactive: false,
                    anchor_output_index: 1,
                    anchor_internal_key: key(5),
                    anchor_key_desc: None,
                    anchor_tapscript_sibling: None,
                    script_key: ScriptKey::new(key(6)),
                    asset: None,
                },
            ],
        };
        packet.prepare_output_assets().unwrap();
        packet
    }

    #[test]
    fn packet_round_trip() {
        let packet = sample_packet();
        let bytes = packet.to_bytes().unwrap();
        let decoded = VPacket::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, packet);

        // Bit-exact: re-encoding yields identical bytes.
        assert_eq!(decoded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn truncated_packet_rejected() {
        let packet = sample_packet();
        let bytes = packet.to_bytes().unwrap();
        assert!(VPacket::from_bytes(&bytes[..bytes.len() - 3]).is_err());
    }
}
