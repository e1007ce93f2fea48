//! stepvm-replay: verifiable single-step execution.
//!
//! One instruction is executed through a logging state-access that records
//! every 64-bit word touch with a Merkle inclusion proof against the state
//! hash tree. The sealed log is self-contained: a verifier that holds no
//! machine state replays the step against the log alone, checking each
//! proof against a rolling root hash and confirming the state-root
//! transition.

pub mod error;
pub mod log;
pub mod record;
pub mod replay;
pub mod step;

pub use error::{ReplayError, StepError};
pub use log::{AccessLog, AccessType, Bracket, BracketKind, LogType, Note, WordAccess};
pub use record::LoggedAccess;
pub use replay::ReplayAccess;
pub use step::{step, verify_step};
