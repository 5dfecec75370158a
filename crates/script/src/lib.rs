//! Script verification, signature hashing and sigop accounting.

pub mod interpreter;
pub mod opcodes;
mod secp;
pub mod sighash;
pub mod sigops;
pub mod standard;

pub use interpreter::{verify_script, ScriptError, ScriptFlags, TransactionSignatureChecker};
pub use sighash::{PrecomputedTransactionData, SigVersion, SighashType};
