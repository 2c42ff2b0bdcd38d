//! Cash token payloads attached to transaction outputs.
//!
//! On the wire a token payload rides inside the output's locking script
//! field: a `0xef` prefix byte, the 32-byte category, a structure
//! bitfield, and the optional commitment and fungible amount. The
//! remainder of the field is the real locking script.

use cashd_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};

pub const TOKEN_PREFIX: u8 = 0xef;

pub const STRUCTURE_HAS_COMMITMENT_LENGTH: u8 = 0x40;
pub const STRUCTURE_HAS_NFT: u8 = 0x20;
pub const STRUCTURE_HAS_AMOUNT: u8 = 0x10;
const STRUCTURE_RESERVED: u8 = 0x80;

pub const CAPABILITY_NONE: u8 = 0x00;
pub const CAPABILITY_MUTABLE: u8 = 0x01;
pub const CAPABILITY_MINTING: u8 = 0x02;

pub const MAX_COMMITMENT_LENGTH: usize = 40;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TokenData {
    pub category: Hash256,
    pub amount: u64,
    pub commitment: Vec<u8>,
    pub bitfield: u8,
}

impl TokenData {
    pub fn has_amount(&self) -> bool {
        self.bitfield & STRUCTURE_HAS_AMOUNT != 0
    }

    pub fn has_nft(&self) -> bool {
        self.bitfield & STRUCTURE_HAS_NFT != 0
    }

    pub fn has_commitment(&self) -> bool {
        self.bitfield & STRUCTURE_HAS_COMMITMENT_LENGTH != 0
    }

    pub fn capability(&self) -> u8 {
        self.bitfield & 0x0f
    }

    pub fn is_valid_bitfield(&self) -> bool {
        if self.bitfield & STRUCTURE_RESERVED != 0 {
            return false;
        }
        // A payload must carry a fungible amount, an NFT, or both.
        if !self.has_amount() && !self.has_nft() {
            return false;
        }
        if self.has_commitment() && !self.has_nft() {
            return false;
        }
        if !self.has_nft() && self.capability() != CAPABILITY_NONE {
            return false;
        }
        self.capability() <= CAPABILITY_MINTING
    }

    pub fn serialized_size(&self) -> usize {
        let mut encoder = Encoder::new();
        self.encode(&mut encoder);
        encoder.len()
    }

    pub fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(TOKEN_PREFIX);
        self.encode_payload(encoder);
    }

    /// Encodes the payload without the `0xef` prefix byte, for storage
    /// formats that record token presence out of band.
    pub fn encode_payload(&self, encoder: &mut Encoder) {
        encoder.write_hash_le(&self.category);
        encoder.write_u8(self.bitfield);
        if self.has_commitment() {
            encoder.write_var_bytes(&self.commitment);
        }
        if self.has_amount() {
            encoder.write_varint(self.amount);
        }
    }

    /// Decodes a payload positioned after the `0xef` prefix byte.
    pub fn decode_after_prefix(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let category = decoder.read_hash_le()?;
        let bitfield = decoder.read_u8()?;
        let mut token = TokenData {
            category,
            amount: 0,
            commitment: Vec::new(),
            bitfield,
        };
        if !token.is_valid_bitfield() {
            return Err(DecodeError::InvalidData("invalid token bitfield"));
        }
        if token.has_commitment() {
            token.commitment = decoder.read_var_bytes()?;
            if token.commitment.is_empty() || token.commitment.len() > MAX_COMMITMENT_LENGTH {
                return Err(DecodeError::InvalidData("invalid token commitment length"));
            }
        }
        if token.has_amount() {
            token.amount = decoder.read_varint()?;
            if token.amount == 0 {
                return Err(DecodeError::InvalidData("token amount must be non-zero"));
            }
        }
        Ok(token)
    }
}

/// Splits a wire-format locking script field into its token payload (if
/// any) and the bare locking script.
pub fn separate_token_from_script(
    wrapped: &[u8],
) -> Result<(Option<TokenData>, Vec<u8>), DecodeError> {
    if wrapped.first().copied() != Some(TOKEN_PREFIX) {
        return Ok((None, wrapped.to_vec()));
    }
    let mut decoder = Decoder::new(&wrapped[1..]);
    let token = TokenData::decode_after_prefix(&mut decoder)?;
    let script = decoder.read_bytes(decoder.remaining())?;
    Ok((Some(token), script))
}

/// Re-joins a token payload and bare script into the wire-format field.
pub fn join_token_and_script(token: Option<&TokenData>, script: &[u8]) -> Vec<u8> {
    match token {
        None => script.to_vec(),
        Some(token) => {
            let mut encoder = Encoder::new();
            token.encode(&mut encoder);
            encoder.write_bytes(script);
            encoder.into_inner()
        }
    }
}
