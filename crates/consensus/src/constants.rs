//! Consensus limits shared across validation code.

/// Blocks a coinbase output must age before it can be spent.
pub const COINBASE_MATURITY: i32 = 100;

/// Maximum byte length of a locking or unlocking script.
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Minimum serialized transaction size enforced once the November 2018
/// rules are active.
pub const MIN_TX_SIZE: usize = 100;

/// Maximum serialized transaction size.
pub const MAX_TX_SIZE: usize = 1_000_000;

/// Maximum allowed coinbase signature script length.
pub const MAX_COINBASE_SCRIPT_LEN: usize = 100;

/// Lock-time values at or above this threshold are interpreted as unix
/// timestamps rather than block heights.
pub const LOCK_TIME_THRESHOLD: u32 = 500_000_000;

/// Sequence number that disables all lock-time semantics for an input.
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;
