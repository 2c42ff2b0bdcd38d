//! Typed acceptance errors.
//!
//! Policy rejections carry a reject code plus a human-readable reason;
//! consensus failures wrap the upstream rule error; store failures
//! propagate unchanged.

use std::fmt;

use cashd_chainstate::{ChainStateError, ValidationError};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RejectCode {
    Duplicate,
    Nonstandard,
    InsufficientFee,
    Invalid,
}

impl RejectCode {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectCode::Duplicate => "duplicate",
            RejectCode::Nonstandard => "nonstandard",
            RejectCode::InsufficientFee => "insufficient fee",
            RejectCode::Invalid => "invalid",
        }
    }
}

#[derive(Clone, Debug)]
pub struct TxRuleError {
    pub code: RejectCode,
    pub reason: String,
}

impl TxRuleError {
    pub fn new(code: RejectCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for TxRuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.reason)
    }
}

impl std::error::Error for TxRuleError {}

#[derive(Debug)]
pub enum MempoolError {
    /// The transaction violates relay policy; never fatal.
    Rule(TxRuleError),
    /// The transaction breaks a consensus rule; permanently
    /// unacceptable until the rules change.
    Consensus(ValidationError),
    /// Underlying store failure; the caller may retry or shut down.
    Chain(ChainStateError),
}

impl MempoolError {
    pub fn rule(code: RejectCode, reason: impl Into<String>) -> Self {
        MempoolError::Rule(TxRuleError::new(code, reason))
    }

    pub fn reject_code(&self) -> RejectCode {
        match self {
            MempoolError::Rule(err) => err.code,
            MempoolError::Consensus(_) => RejectCode::Invalid,
            MempoolError::Chain(_) => RejectCode::Invalid,
        }
    }
}

impl fmt::Display for MempoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MempoolError::Rule(err) => write!(f, "{err}"),
            MempoolError::Consensus(err) => write!(f, "{err}"),
            MempoolError::Chain(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for MempoolError {}

impl From<TxRuleError> for MempoolError {
    fn from(err: TxRuleError) -> Self {
        MempoolError::Rule(err)
    }
}

impl From<ValidationError> for MempoolError {
    fn from(err: ValidationError) -> Self {
        MempoolError::Consensus(err)
    }
}

impl From<ChainStateError> for MempoolError {
    fn from(err: ChainStateError) -> Self {
        MempoolError::Chain(err)
    }
}
