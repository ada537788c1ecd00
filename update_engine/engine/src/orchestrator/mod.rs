//! Per-role drivers: the shared update cycle and the Primary and Secondary
//! ECU contexts. Each context owns its state explicitly; nothing is global.

pub mod cycle;
pub mod primary;
pub mod secondary;

pub use cycle::{DownloadOutcome, FirmwareOutcome, UpdateCycle, UpdateCycleReport};
pub use primary::PrimaryEcu;
pub use secondary::{SecondaryEcu, SecondaryState};
