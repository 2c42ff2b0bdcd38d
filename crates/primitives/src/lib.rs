//! Core block/transaction types and consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod token;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use hash::{hash_to_hex, sha256, sha256d};
pub use outpoint::OutPoint;
pub use token::TokenData;
pub use transaction::{Transaction, TxIn, TxOut};
