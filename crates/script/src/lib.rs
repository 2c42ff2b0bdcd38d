//! Script-verification flags, standardness helpers, and the shared
//! signature/sighash caches consulted during input validation.

pub mod hashcache;
pub mod sigcache;
pub mod standard;

pub use hashcache::{HashCache, TxSigHashes};
pub use sigcache::SigCache;

pub type ScriptFlags = u32;

pub const SCRIPT_VERIFY_NONE: ScriptFlags = 0;
pub const SCRIPT_VERIFY_P2SH: ScriptFlags = 1 << 0;
pub const SCRIPT_VERIFY_STRICT_ENC: ScriptFlags = 1 << 1;
pub const SCRIPT_VERIFY_DER_SIGNATURES: ScriptFlags = 1 << 2;
pub const SCRIPT_VERIFY_LOW_S: ScriptFlags = 1 << 3;
pub const SCRIPT_VERIFY_SIG_PUSH_ONLY: ScriptFlags = 1 << 4;
pub const SCRIPT_VERIFY_MINIMAL_DATA: ScriptFlags = 1 << 5;
pub const SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS: ScriptFlags = 1 << 6;
pub const SCRIPT_VERIFY_CLEAN_STACK: ScriptFlags = 1 << 7;
pub const SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY: ScriptFlags = 1 << 8;
pub const SCRIPT_VERIFY_CHECKSEQUENCEVERIFY: ScriptFlags = 1 << 9;
pub const SCRIPT_VERIFY_NULLFAIL: ScriptFlags = 1 << 10;

/// Enforces the standardness cap on the number of signature checks
/// executed per input.
pub const SCRIPT_VERIFY_INPUT_SIG_CHECKS: ScriptFlags = 1 << 11;

/// Recognizes cash token prefixes once the May 2023 rules are active.
pub const SCRIPT_ALLOW_CASH_TOKENS: ScriptFlags = 1 << 12;

/// Enables the May 2025 VM limits.
pub const SCRIPT_ALLOW_MAY2025: ScriptFlags = 1 << 13;

/// Applies the stricter standard-only subset of the May 2025 rules.
pub const SCRIPT_ALLOW_MAY2025_STANDARD_ONLY: ScriptFlags = 1 << 14;

pub const MANDATORY_VERIFY_FLAGS: ScriptFlags = SCRIPT_VERIFY_P2SH
    | SCRIPT_VERIFY_STRICT_ENC
    | SCRIPT_VERIFY_LOW_S
    | SCRIPT_VERIFY_NULLFAIL
    | SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY
    | SCRIPT_VERIFY_CHECKSEQUENCEVERIFY;

pub const STANDARD_VERIFY_FLAGS: ScriptFlags = MANDATORY_VERIFY_FLAGS
    | SCRIPT_VERIFY_DER_SIGNATURES
    | SCRIPT_VERIFY_SIG_PUSH_ONLY
    | SCRIPT_VERIFY_MINIMAL_DATA
    | SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | SCRIPT_VERIFY_CLEAN_STACK
    | SCRIPT_VERIFY_INPUT_SIG_CHECKS;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_are_distinct() {
        let flags = [
            SCRIPT_VERIFY_P2SH,
            SCRIPT_VERIFY_STRICT_ENC,
            SCRIPT_VERIFY_DER_SIGNATURES,
            SCRIPT_VERIFY_LOW_S,
            SCRIPT_VERIFY_SIG_PUSH_ONLY,
            SCRIPT_VERIFY_MINIMAL_DATA,
            SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS,
            SCRIPT_VERIFY_CLEAN_STACK,
            SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY,
            SCRIPT_VERIFY_CHECKSEQUENCEVERIFY,
            SCRIPT_VERIFY_NULLFAIL,
            SCRIPT_VERIFY_INPUT_SIG_CHECKS,
            SCRIPT_ALLOW_CASH_TOKENS,
            SCRIPT_ALLOW_MAY2025,
            SCRIPT_ALLOW_MAY2025_STANDARD_ONLY,
        ];
        let mut seen: ScriptFlags = 0;
        for flag in flags {
            assert_eq!(seen & flag, 0);
            seen |= flag;
        }
    }

    #[test]
    fn standard_includes_mandatory_and_sig_checks() {
        assert_eq!(
            STANDARD_VERIFY_FLAGS & MANDATORY_VERIFY_FLAGS,
            MANDATORY_VERIFY_FLAGS
        );
        assert_ne!(STANDARD_VERIFY_FLAGS & SCRIPT_VERIFY_INPUT_SIG_CHECKS, 0);
        assert_eq!(STANDARD_VERIFY_FLAGS & SCRIPT_ALLOW_CASH_TOKENS, 0);
    }
}
