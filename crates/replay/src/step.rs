//! The step driver: log exactly one instruction, and verify such a log.

use stepvm_machine::access::{BracketType, StateAccess};
use stepvm_machine::interp::interpret;
use stepvm_machine::Machine;
use stepvm_merkle::{Hash, MerkleTree};

use crate::error::{ReplayError, StepError};
use crate::log::{AccessLog, LogType};
use crate::record::LoggedAccess;
use crate::replay::ReplayAccess;

/// Execute exactly one step (one retired instruction or taken trap) through
/// the logging state access, sealing the resulting log with the before and
/// after state roots.
///
/// `tree` is brought up to date before the step (a full hash the first
/// time, dirty pages afterwards) and again at finalisation.
pub fn step(
    machine: &mut Machine,
    tree: &mut MerkleTree,
    log_type: LogType,
) -> Result<AccessLog, StepError> {
    machine.update_merkle_tree(tree)?;
    let before_root = tree.get_root_hash();
    let mcycle = machine.state.mcycle;

    let mut access = LoggedAccess::new(&mut machine.state, tree, log_type);
    access.push_bracket(BracketType::Begin, "step");
    interpret(&mut access, mcycle.wrapping_add(1))?;
    access.push_bracket(BracketType::End, "step");
    let mut log = access.finish();

    machine.update_merkle_tree(tree)?;
    log.before_root = before_root;
    log.after_root = tree.get_root_hash();
    tracing::debug!(
        accesses = log.len(),
        proofs = log.log_type.proofs,
        "step sealed"
    );
    Ok(log)
}

/// Replay a sealed log against `before_root` without any machine state.
///
/// Consumes the log exactly; with `verify_proofs`, every access is checked
/// against the rolling root and the final root must equal the log's
/// after-root. Returns the final rolling root.
pub fn verify_step(
    log: &AccessLog,
    before_root: Hash,
    verify_proofs: bool,
) -> Result<Hash, ReplayError> {
    let mut access = ReplayAccess::new(log, before_root, verify_proofs)?;
    interpret(&mut access, 1)?;
    let root = access.finish()?;
    if verify_proofs && root != log.after_root {
        return Err(ReplayError::FinalRootMismatch);
    }
    Ok(root)
}
