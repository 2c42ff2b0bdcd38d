//! Monetary units and range checks.

/// One coin in satoshis.
pub const COIN: i64 = 100_000_000;

/// Maximum number of satoshis that can ever exist.
pub const MAX_MONEY: i64 = 21_000_000 * COIN;

pub fn money_range(value: i64) -> bool {
    (0..=MAX_MONEY).contains(&value)
}
