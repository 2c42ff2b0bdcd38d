//! Standard script classification and parsing utilities.

use cashd_consensus::constants::MAX_SCRIPT_SIZE;

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    P2Pk,
    P2Pkh,
    P2Sh,
    NullData,
    Unknown,
}

pub fn classify_script_pubkey(script: &[u8]) -> ScriptType {
    if is_p2pkh(script) {
        ScriptType::P2Pkh
    } else if is_p2sh(script) {
        ScriptType::P2Sh
    } else if script.first().copied() == Some(OP_RETURN) {
        ScriptType::NullData
    } else if is_p2pk(script) {
        ScriptType::P2Pk
    } else {
        ScriptType::Unknown
    }
}

fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

fn is_p2pk(script: &[u8]) -> bool {
    let key_len = match script.first().copied() {
        Some(len @ 33) => len,
        Some(len @ 65) => len,
        _ => return false,
    };

    let expected_len = key_len as usize + 2;
    script.len() == expected_len && script[script.len() - 1] == OP_CHECKSIG
}

/// Provably unspendable outputs are never worth tracking in the UTXO
/// set: anything led by OP_RETURN, or a script too large to ever
/// validate.
pub fn is_unspendable(script: &[u8]) -> bool {
    if script.len() > MAX_SCRIPT_SIZE {
        return true;
    }
    script.first().copied() == Some(OP_RETURN)
}

pub fn is_push_only(script: &[u8]) -> bool {
    parse_push_only_stack(script).is_some()
}

/// Parses a push-only script into the stack items it would leave behind,
/// or `None` if it contains any non-push opcode or truncated data.
pub fn parse_push_only_stack(script: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut cursor = 0usize;
    let mut stack = Vec::new();
    while cursor < script.len() {
        let opcode = *script.get(cursor)?;
        cursor = cursor.saturating_add(1);
        let (len, is_data) = match opcode {
            0x01..=0x4b => (opcode as usize, true),
            OP_PUSHDATA1 => (*script.get(cursor)? as usize, {
                cursor = cursor.saturating_add(1);
                true
            }),
            OP_PUSHDATA2 => {
                let lo = *script.get(cursor)? as usize;
                let hi = *script.get(cursor + 1)? as usize;
                cursor = cursor.saturating_add(2);
                ((hi << 8) | lo, true)
            }
            OP_PUSHDATA4 => {
                let b0 = *script.get(cursor)? as usize;
                let b1 = *script.get(cursor + 1)? as usize;
                let b2 = *script.get(cursor + 2)? as usize;
                let b3 = *script.get(cursor + 3)? as usize;
                cursor = cursor.saturating_add(4);
                ((b3 << 24) | (b2 << 16) | (b1 << 8) | b0, true)
            }
            OP_0 => {
                stack.push(Vec::new());
                (0, false)
            }
            OP_1NEGATE => {
                stack.push(vec![0x81]);
                (0, false)
            }
            OP_1..=OP_16 => {
                stack.push(vec![opcode - OP_1 + 1]);
                (0, false)
            }
            _ => return None,
        };

        if is_data {
            if cursor.saturating_add(len) > script.len() {
                return None;
            }
            stack.push(script[cursor..cursor + len].to_vec());
            cursor = cursor.saturating_add(len);
        }
    }
    Some(stack)
}

fn decode_op_n(opcode: u8) -> Option<u8> {
    match opcode {
        OP_0 => Some(0),
        OP_1..=OP_16 => Some(opcode - OP_1 + 1),
        _ => None,
    }
}

/// Counts signature operations in a script. With `accurate` set,
/// CHECKMULTISIG preceded by a small-integer push counts that many keys
/// rather than the worst-case 20.
pub fn count_sigops(script: &[u8], accurate: bool) -> Option<u32> {
    let mut cursor = 0usize;
    let mut last_opcode = 0u8;
    let mut count = 0u32;
    while cursor < script.len() {
        let opcode = *script.get(cursor)?;
        cursor = cursor.saturating_add(1);
        match opcode {
            0x01..=0x4b => {
                cursor = cursor.saturating_add(opcode as usize);
            }
            OP_PUSHDATA1 => {
                let len = *script.get(cursor)? as usize;
                cursor = cursor.saturating_add(1 + len);
            }
            OP_PUSHDATA2 => {
                let lo = *script.get(cursor)? as usize;
                let hi = *script.get(cursor + 1)? as usize;
                cursor = cursor.saturating_add(2 + ((hi << 8) | lo));
            }
            OP_PUSHDATA4 => {
                let b0 = *script.get(cursor)? as usize;
                let b1 = *script.get(cursor + 1)? as usize;
                let b2 = *script.get(cursor + 2)? as usize;
                let b3 = *script.get(cursor + 3)? as usize;
                cursor = cursor.saturating_add(4 + ((b3 << 24) | (b2 << 16) | (b1 << 8) | b0));
            }
            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                count = count.saturating_add(1);
            }
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                let add = if accurate {
                    decode_op_n(last_opcode).unwrap_or(20) as u32
                } else {
                    20
                };
                count = count.saturating_add(add);
            }
            _ => {}
        }
        if cursor > script.len() {
            return None;
        }
        last_opcode = opcode;
    }
    Some(count)
}

/// A standard data-carrier output: OP_RETURN followed by at most one
/// push of no more than `max_bytes`.
pub fn is_standard_op_return(script: &[u8], max_bytes: usize) -> bool {
    if script.first().copied() != Some(OP_RETURN) {
        return false;
    }
    if script.len() == 1 {
        return true;
    }

    let mut cursor = 1usize;
    let opcode = match script.get(cursor) {
        Some(opcode) => *opcode,
        None => return false,
    };
    cursor = cursor.saturating_add(1);

    let len = match opcode {
        0x01..=0x4b => opcode as usize,
        OP_PUSHDATA1 => {
            let len = match script.get(cursor) {
                Some(byte) => *byte as usize,
                None => return false,
            };
            cursor = cursor.saturating_add(1);
            len
        }
        OP_PUSHDATA2 => {
            let lo = match script.get(cursor) {
                Some(byte) => *byte as usize,
                None => return false,
            };
            let hi = match script.get(cursor + 1) {
                Some(byte) => *byte as usize,
                None => return false,
            };
            cursor = cursor.saturating_add(2);
            (hi << 8) | lo
        }
        OP_0 | OP_1NEGATE | OP_1..=OP_16 => 0,
        _ => return false,
    };

    if len > max_bytes {
        return false;
    }
    cursor.saturating_add(len) == script.len()
}
