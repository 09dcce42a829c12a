//! Bootloader contract and the try/trying two-slot protocol.
//!
//! Kernel and OS snap refreshes stage the new revision in a "try" boot
//! variable and let the bootloader fall back automatically if the next
//! boot does not reach userspace. The core only reads and writes string
//! variables; the on-disk formats belong to the bootloader collaborator.

mod mem;

pub use mem::MemBootloader;

use std::collections::BTreeMap;

use snaplite_shared::errors::{SnapError, SnapResult};

/// `snap_mode` values the protocol recognizes.
pub const MODE_TRY: &str = "try";
pub const MODE_TRYING: &str = "trying";

/// Which boot slot pair a staged snap uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootSnapKind {
    Core,
    Kernel,
}

impl BootSnapKind {
    /// The variable naming the currently good revision.
    pub fn good_var(&self) -> &'static str {
        match self {
            BootSnapKind::Core => "snap_core",
            BootSnapKind::Kernel => "snap_kernel",
        }
    }

    /// The variable naming the staged candidate revision.
    pub fn try_var(&self) -> &'static str {
        match self {
            BootSnapKind::Core => "snap_try_core",
            BootSnapKind::Kernel => "snap_try_kernel",
        }
    }
}

/// Abstract bootloader: string variables read and written as whole maps.
///
/// `set_boot_vars` must apply the entire map atomically; callers serialize
/// invocations by holding the state lock across them.
pub trait Bootloader: Send + Sync {
    fn get_boot_vars(&self, names: &[&str]) -> SnapResult<BTreeMap<String, String>>;
    fn set_boot_vars(&self, vars: BTreeMap<String, String>) -> SnapResult<()>;
}

/// Outcome of evaluating the try protocol after a reboot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootOutcome {
    /// The bootloader carries no try state at all; nothing to do.
    NoOp,
    /// The staged revision booted and reached userspace; it was promoted
    /// to the good slot.
    Success { revision: String },
    /// The staged revision did not complete a boot; the try state was
    /// cleared so the old revision keeps booting.
    Reverted,
}

/// Stage a candidate revision: write the try variable and enter try mode.
/// The reboot that exercises it happens out of band.
pub fn stage_try(bl: &dyn Bootloader, kind: BootSnapKind, revision: &str) -> SnapResult<()> {
    let mut vars = BTreeMap::new();
    vars.insert(kind.try_var().to_string(), revision.to_string());
    vars.insert("snap_mode".to_string(), MODE_TRY.to_string());
    tracing::info!(var = %kind.try_var(), revision = %revision, "Staging boot candidate");
    bl.set_boot_vars(vars)
}

/// Evaluate `snap_mode` after a reboot and settle the slots.
///
/// - mode `"trying"`: the candidate booted; promote it and clear try state.
/// - mode `"try"`: the boot never completed; clear try state (revert).
/// - empty mode or an empty variable map: no-op (non-OS snap path).
///
/// # Errors
///
/// An unrecognized `snap_mode` value is a bootloader inconsistency.
pub fn evaluate_try(bl: &dyn Bootloader, kind: BootSnapKind) -> SnapResult<BootOutcome> {
    let names = ["snap_mode", kind.try_var(), kind.good_var()];
    let vars = bl.get_boot_vars(&names)?;
    let mode = vars.get("snap_mode").map(String::as_str).unwrap_or("");
    match mode {
        "" => Ok(BootOutcome::NoOp),
        MODE_TRY => {
            let mut clear = BTreeMap::new();
            clear.insert(kind.try_var().to_string(), String::new());
            clear.insert("snap_mode".to_string(), String::new());
            bl.set_boot_vars(clear)?;
            tracing::warn!(var = %kind.try_var(), "Boot candidate did not come up, reverted");
            Ok(BootOutcome::Reverted)
        }
        MODE_TRYING => {
            let revision = vars.get(kind.try_var()).cloned().unwrap_or_default();
            let mut promote = BTreeMap::new();
            promote.insert(kind.good_var().to_string(), revision.clone());
            promote.insert(kind.try_var().to_string(), String::new());
            promote.insert("snap_mode".to_string(), String::new());
            bl.set_boot_vars(promote)?;
            tracing::info!(var = %kind.good_var(), revision = %revision, "Boot candidate confirmed");
            Ok(BootOutcome::Success { revision })
        }
        other => Err(SnapError::Boot(format!(
            "unexpected snap_mode value {:?}",
            other
        ))),
    }
}
