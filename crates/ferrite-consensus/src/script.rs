//! Script-checking and frozen-output collaborators.
//!
//! Script interpretation lives outside this engine. The chain manager only
//! needs a pure check that can be run concurrently and cancelled.

use crate::{OutPoint, Transaction, TxOut};
use bitflags::bitflags;
use tokio_util::sync::CancellationToken;

bitflags! {
    /// Script verification flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ScriptFlags: u32 {
        const P2SH = 1 << 0;
        const STRICTENC = 1 << 1;
        const DERSIG = 1 << 2;
        const LOW_S = 1 << 3;
        const CHECKLOCKTIMEVERIFY = 1 << 4;
    }
}

/// Outcome of checking one transaction's inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptCheckResult {
    Valid,
    Invalid(String),
    /// The token fired before a verdict was reached.
    Cancelled,
}

/// External script-checking service.
///
/// `spent` holds the outputs consumed by `tx`, one per input in input order.
/// Implementations must poll `cancel` at a fine granularity and return
/// [`ScriptCheckResult::Cancelled`] once it fires.
pub trait ScriptChecker: Send + Sync {
    fn check_inputs(
        &self,
        tx: &Transaction,
        spent: &[TxOut],
        flags: ScriptFlags,
        cancel: &CancellationToken,
    ) -> ScriptCheckResult;
}

/// Checker that accepts every script. Used on networks where script
/// validation is delegated and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllScripts;

impl ScriptChecker for AcceptAllScripts {
    fn check_inputs(
        &self,
        _tx: &Transaction,
        _spent: &[TxOut],
        _flags: ScriptFlags,
        cancel: &CancellationToken,
    ) -> ScriptCheckResult {
        if cancel.is_cancelled() {
            ScriptCheckResult::Cancelled
        } else {
            ScriptCheckResult::Valid
        }
    }
}

/// Source of outputs that consensus-freeze anomalies have been reported for.
pub trait FrozenOutputs: Send + Sync {
    /// Whether spending `outpoint` in a block at `height` is frozen.
    fn is_frozen(&self, outpoint: &OutPoint, height: i32) -> bool;
}

/// No outputs are frozen.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFrozenOutputs;

impl FrozenOutputs for NoFrozenOutputs {
    fn is_frozen(&self, _outpoint: &OutPoint, _height: i32) -> bool {
        false
    }
}
