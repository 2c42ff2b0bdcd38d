//! The transaction memory pool: policy-enforced storage for validated
//! unconfirmed transactions, plus the orphan pool for transactions
//! whose parents have not arrived yet.

pub mod adapters;
pub mod error;
pub mod orphans;
pub mod policy;
pub mod pool;

pub use adapters::{AddrIndexAdapter, ChainAdapter, FeeEstimatorAdapter, ScriptValidator};
pub use error::{MempoolError, RejectCode, TxRuleError};
pub use policy::Policy;
pub use pool::{PoolConfig, Tag, TxDesc, TxPool};
