//! The spend journal: per-block pre-images of every consumed output,
//! keyed by block hash and read back when a block is disconnected.

use cashd_consensus::Hash256;
use cashd_primitives::encoding::{DecodeError, Decoder, Encoder};
use cashd_primitives::token::TokenData;
use cashd_storage::{Column, KeyValueStore, WriteBatch};

use crate::utxo::{compress_amount, decompress_amount, read_vlq, write_vlq};
use crate::ChainStateError;

/// Pre-image of one spent output, in block/transaction/input order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StxoRecord {
    pub amount: i64,
    pub script: Vec<u8>,
    pub token_data: Option<TokenData>,
    pub height: i32,
    pub is_coinbase: bool,
}

impl StxoRecord {
    fn encode(&self, buf: &mut Vec<u8>) {
        let header = (self.height as u64) << 1 | u64::from(self.is_coinbase);
        write_vlq(buf, header);
        write_vlq(buf, compress_amount(self.amount as u64));
        match &self.token_data {
            Some(token) => {
                buf.push(1);
                let mut encoder = Encoder::new();
                token.encode_payload(&mut encoder);
                let payload = encoder.into_inner();
                write_vlq(buf, payload.len() as u64);
                buf.extend_from_slice(&payload);
            }
            None => buf.push(0),
        }
        write_vlq(buf, self.script.len() as u64);
        buf.extend_from_slice(&self.script);
    }

    fn decode(bytes: &[u8], cursor: &mut usize) -> Result<Self, DecodeError> {
        let header = read_vlq(bytes, cursor)?;
        let height = (header >> 1) as i32;
        let is_coinbase = header & 1 == 1;
        let amount = decompress_amount(read_vlq(bytes, cursor)?) as i64;

        let token_flag = *bytes.get(*cursor).ok_or(DecodeError::UnexpectedEof)?;
        *cursor += 1;
        let token_data = match token_flag {
            0 => None,
            1 => {
                let len = read_vlq(bytes, cursor)? as usize;
                let end = cursor.checked_add(len).ok_or(DecodeError::SizeTooLarge)?;
                let payload = bytes.get(*cursor..end).ok_or(DecodeError::UnexpectedEof)?;
                *cursor = end;
                let mut decoder = Decoder::new(payload);
                let token = TokenData::decode_after_prefix(&mut decoder)?;
                if !decoder.is_empty() {
                    return Err(DecodeError::TrailingBytes);
                }
                Some(token)
            }
            _ => return Err(DecodeError::InvalidData("invalid token presence byte")),
        };

        let script_len = read_vlq(bytes, cursor)? as usize;
        let end = cursor
            .checked_add(script_len)
            .ok_or(DecodeError::SizeTooLarge)?;
        let script = bytes
            .get(*cursor..end)
            .ok_or(DecodeError::UnexpectedEof)?
            .to_vec();
        *cursor = end;

        Ok(Self {
            amount,
            script,
            token_data,
            height,
            is_coinbase,
        })
    }
}

pub fn serialize_spend_journal(stxos: &[StxoRecord]) -> Vec<u8> {
    let mut buf = Vec::new();
    write_vlq(&mut buf, stxos.len() as u64);
    for stxo in stxos {
        stxo.encode(&mut buf);
    }
    buf
}

pub fn deserialize_spend_journal(bytes: &[u8]) -> Result<Vec<StxoRecord>, DecodeError> {
    let mut cursor = 0usize;
    let count = read_vlq(bytes, &mut cursor)? as usize;
    let mut stxos = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        stxos.push(StxoRecord::decode(bytes, &mut cursor)?);
    }
    if cursor != bytes.len() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(stxos)
}

pub fn put_spend_journal(batch: &mut WriteBatch, block_hash: &Hash256, stxos: &[StxoRecord]) {
    batch.put(Column::SpendJournal, *block_hash, serialize_spend_journal(stxos));
}

pub fn delete_spend_journal(batch: &mut WriteBatch, block_hash: &Hash256) {
    batch.delete(Column::SpendJournal, *block_hash);
}

/// Loads the journal for a block. Blocks that spent nothing may have no
/// journal at all; that reads back as an empty record list.
pub fn fetch_spend_journal<S: KeyValueStore>(
    store: &S,
    block_hash: &Hash256,
) -> Result<Vec<StxoRecord>, ChainStateError> {
    match store.get(Column::SpendJournal, block_hash.as_slice())? {
        Some(bytes) => Ok(deserialize_spend_journal(&bytes)?),
        None => Ok(Vec::new()),
    }
}
