//! Registration services: the Director's ECU key registry and the Primary's
//! record of attached Secondaries.

pub mod ecu_registry;
pub mod secondary_registry;

pub use ecu_registry::{EcuRegistry, RegistrationPolicy};
pub use secondary_registry::{SecondaryRecord, SecondaryRegistry};

/// What a registration call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// First registration of this serial.
    New,
    /// Same identity registered again; nothing changed.
    Unchanged,
    /// The stored record was replaced or completed.
    Replaced,
}
