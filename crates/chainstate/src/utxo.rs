//! The unspent-output record and its on-disk codec.
//!
//! The serialized form must stay bit-for-bit compatible with the
//! pre-existing database layout: a VLQ header code packing the creating
//! height and coinbase flag, the compressed amount as a VLQ, an optional
//! token payload, and the raw locking script as the remainder of the
//! value.

use cashd_consensus::Hash256;
use cashd_primitives::encoding::{DecodeError, Decoder, Encoder};
use cashd_primitives::outpoint::OutPoint;
use cashd_primitives::token::TokenData;
use cashd_primitives::transaction::TxOut;

/// Height recorded for outputs that only exist in the transaction pool.
pub const UNMINED_HEIGHT: i32 = 0x7fff_ffff;

pub const TF_COINBASE: u8 = 1 << 0;
pub const TF_SPENT: u8 = 1 << 1;
pub const TF_MODIFIED: u8 = 1 << 2;
pub const TF_FRESH: u8 = 1 << 3;

/// Fixed per-entry overhead charged against the cache budget, alongside
/// the script bytes and any token payload.
const BASE_ENTRY_SIZE: u64 = 40;
const BASE_TOKEN_DATA_SIZE: u64 = 88;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UtxoEntry {
    pub(crate) amount: i64,
    pub(crate) script: Vec<u8>,
    pub(crate) token_data: Option<TokenData>,
    pub(crate) block_height: i32,
    pub(crate) flags: u8,
}

impl UtxoEntry {
    pub fn new(tx_out: &TxOut, block_height: i32, is_coinbase: bool) -> Self {
        let mut flags = 0;
        if is_coinbase {
            flags |= TF_COINBASE;
        }
        Self {
            amount: tx_out.value,
            script: tx_out.script_pubkey.clone(),
            token_data: tx_out.token_data.clone(),
            block_height,
            flags,
        }
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn script(&self) -> &[u8] {
        &self.script
    }

    pub fn token_data(&self) -> Option<&TokenData> {
        self.token_data.as_ref()
    }

    pub fn block_height(&self) -> i32 {
        self.block_height
    }

    pub fn is_coinbase(&self) -> bool {
        self.flags & TF_COINBASE != 0
    }

    pub fn is_spent(&self) -> bool {
        self.flags & TF_SPENT != 0
    }

    pub fn is_modified(&self) -> bool {
        self.flags & TF_MODIFIED != 0
    }

    pub fn is_fresh(&self) -> bool {
        self.flags & TF_FRESH != 0
    }

    /// Marks the output spent. Spending an already-spent output has no
    /// effect.
    pub fn spend(&mut self) {
        if self.is_spent() {
            return;
        }
        self.flags |= TF_SPENT | TF_MODIFIED;
    }

    /// Approximate resident size of the entry in bytes. Not a consensus
    /// value; the flush thresholds use it loosely.
    pub fn memory_usage(&self) -> u64 {
        let token = match &self.token_data {
            Some(token) => BASE_TOKEN_DATA_SIZE + token.commitment.len() as u64,
            None => 0,
        };
        BASE_ENTRY_SIZE + self.script.len() as u64 + token
    }

    pub fn serialize(&self) -> Vec<u8> {
        let header = (self.block_height as u64) << 1 | u64::from(self.is_coinbase());
        let mut buf = Vec::with_capacity(8 + self.script.len());
        write_vlq(&mut buf, header);
        write_vlq(&mut buf, compress_amount(self.amount as u64));
        match &self.token_data {
            Some(token) => {
                buf.push(1);
                let mut encoder = Encoder::new();
                token.encode_payload(&mut encoder);
                buf.extend_from_slice(&encoder.into_inner());
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&self.script);
        buf
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = 0usize;
        let header = read_vlq(bytes, &mut cursor)?;
        let block_height = (header >> 1) as i32;
        let is_coinbase = header & 1 == 1;
        let amount = decompress_amount(read_vlq(bytes, &mut cursor)?) as i64;

        let token_flag = *bytes
            .get(cursor)
            .ok_or(DecodeError::UnexpectedEof)?;
        cursor += 1;
        let mut decoder = Decoder::new(&bytes[cursor..]);
        let token_data = match token_flag {
            0 => None,
            1 => Some(TokenData::decode_after_prefix(&mut decoder)?),
            _ => return Err(DecodeError::InvalidData("invalid token presence byte")),
        };
        let script = decoder.read_bytes(decoder.remaining())?;

        let mut flags = 0;
        if is_coinbase {
            flags |= TF_COINBASE;
        }
        Ok(Self {
            amount,
            script,
            token_data,
            block_height,
            flags,
        })
    }
}

/// Database key for an outpoint: the transaction hash followed by the
/// VLQ-encoded output index.
pub fn outpoint_key(outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(36);
    key.extend_from_slice(&outpoint.hash);
    write_vlq(&mut key, outpoint.index as u64);
    key
}

pub fn parse_outpoint_key(key: &[u8]) -> Result<OutPoint, DecodeError> {
    if key.len() < 33 {
        return Err(DecodeError::UnexpectedEof);
    }
    let mut hash: Hash256 = [0u8; 32];
    hash.copy_from_slice(&key[..32]);
    let mut cursor = 32usize;
    let index = read_vlq(key, &mut cursor)?;
    if cursor != key.len() {
        return Err(DecodeError::TrailingBytes);
    }
    let index = u32::try_from(index).map_err(|_| DecodeError::SizeTooLarge)?;
    Ok(OutPoint::new(hash, index))
}

/// Variable-length quantity with a continuation high bit and a +1 bias
/// on each continuation byte, so every value has exactly one encoding.
pub fn write_vlq(buf: &mut Vec<u8>, mut value: u64) {
    let mut tmp = [0u8; 10];
    let mut offset = 0usize;
    loop {
        let high_bit = if offset > 0 { 0x80 } else { 0 };
        tmp[offset] = (value & 0x7f) as u8 | high_bit;
        if value <= 0x7f {
            break;
        }
        value = (value >> 7) - 1;
        offset += 1;
    }
    for idx in (0..=offset).rev() {
        buf.push(tmp[idx]);
    }
}

pub fn read_vlq(bytes: &[u8], cursor: &mut usize) -> Result<u64, DecodeError> {
    let mut value = 0u64;
    loop {
        let byte = *bytes.get(*cursor).ok_or(DecodeError::UnexpectedEof)?;
        *cursor += 1;
        value = (value << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0x80 {
            value += 1;
        } else {
            break;
        }
    }
    Ok(value)
}

/// Maps common satoshi amounts (multiples of powers of ten) to small
/// integers before VLQ encoding.
pub fn compress_amount(amount: u64) -> u64 {
    if amount == 0 {
        return 0;
    }
    let mut amount = amount;
    let mut exponent = 0u64;
    while amount % 10 == 0 && exponent < 9 {
        amount /= 10;
        exponent += 1;
    }
    if exponent < 9 {
        let last_digit = amount % 10;
        amount /= 10;
        1 + 10 * (9 * amount + last_digit - 1) + exponent
    } else {
        10 + 10 * (amount - 1)
    }
}

pub fn decompress_amount(compressed: u64) -> u64 {
    if compressed == 0 {
        return 0;
    }
    let mut x = compressed - 1;
    let exponent = x % 10;
    x /= 10;
    let mut amount = if exponent < 9 {
        let last_digit = x % 9 + 1;
        x /= 9;
        x * 10 + last_digit
    } else {
        x + 1
    };
    for _ in 0..exponent {
        amount *= 10;
    }
    amount
}
