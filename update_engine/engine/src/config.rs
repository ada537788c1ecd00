// File: src/config.rs

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::UpdateError;
use crate::registry::RegistrationPolicy;
use crate::types::{EcuSerial, Vin};

pub const DEFAULT_VIN: &str = "111";
pub const DEFAULT_PRIMARY_SERIAL: &str = "11111";
pub const DEFAULT_SECONDARY_SERIAL: &str = "22222";
pub const DEFAULT_DIRECTOR_PORT: u16 = 30501;
pub const DEFAULT_PRIMARY_PORT: u16 = 30701;
pub const DEFAULT_SECONDARY_PORT: u16 = 30801;
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Which process this configuration is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcuRole {
    Director,
    Primary,
    Secondary,
}

/// Per-process settings, built from role defaults and then environment overrides.
#[derive(Debug, Clone)]
pub struct EcuConfig {
    pub role: EcuRole,
    pub vin: Vin,
    pub ecu_serial: EcuSerial,
    /// Holds `targets/`, keys and cached roots of trust.
    pub client_dir: PathBuf,
    pub firmware_filename: String,
    pub director_addr: SocketAddr,
    pub primary_addr: SocketAddr,
    pub secondary_addr: SocketAddr,
    pub rpc_timeout: Duration,
    pub registration_policy: RegistrationPolicy,
}

impl EcuConfig {
    pub fn defaults(role: EcuRole) -> Self {
        let (serial, client_dir, firmware) = match role {
            EcuRole::Director => ("director", "temp_director", ""),
            EcuRole::Primary => (DEFAULT_PRIMARY_SERIAL, "temp_primary", "infotainment_firmware.txt"),
            EcuRole::Secondary => (DEFAULT_SECONDARY_SERIAL, "temp_secondary", "secondary_firmware.txt"),
        };
        EcuConfig {
            role,
            vin: Vin::from(DEFAULT_VIN),
            ecu_serial: EcuSerial::from(serial),
            client_dir: PathBuf::from(client_dir),
            firmware_filename: firmware.to_string(),
            director_addr: localhost(DEFAULT_DIRECTOR_PORT),
            primary_addr: localhost(DEFAULT_PRIMARY_PORT),
            secondary_addr: localhost(DEFAULT_SECONDARY_PORT),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            registration_policy: RegistrationPolicy::default(),
        }
    }

    /// Role defaults overridden by `UPTANE_*` environment variables.
    pub fn from_env(role: EcuRole) -> Result<Self, UpdateError> {
        Self::from_lookup(role, |name| std::env::var(name).ok())
    }

    /// Same as [`EcuConfig::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(role: EcuRole, lookup: F) -> Result<Self, UpdateError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::defaults(role);

        if let Some(vin) = lookup("UPTANE_VIN") {
            config.vin = Vin(vin);
        }
        if let Some(serial) = lookup("UPTANE_ECU_SERIAL") {
            config.ecu_serial = EcuSerial(serial);
        }
        if let Some(dir) = lookup("UPTANE_CLIENT_DIR") {
            config.client_dir = PathBuf::from(dir);
        }
        if let Some(name) = lookup("UPTANE_FIRMWARE_FILENAME") {
            config.firmware_filename = name;
        }
        if let Some(addr) = lookup("UPTANE_DIRECTOR_ADDR") {
            config.director_addr = socket_addr("UPTANE_DIRECTOR_ADDR", &addr)?;
        }
        if let Some(addr) = lookup("UPTANE_PRIMARY_ADDR") {
            config.primary_addr = socket_addr("UPTANE_PRIMARY_ADDR", &addr)?;
        }
        if let Some(addr) = lookup("UPTANE_SECONDARY_ADDR") {
            config.secondary_addr = socket_addr("UPTANE_SECONDARY_ADDR", &addr)?;
        }
        if let Some(secs) = lookup("UPTANE_RPC_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|_| UpdateError::Config(format!("UPTANE_RPC_TIMEOUT_SECS={secs:?} is not a number")))?;
            config.rpc_timeout = Duration::from_secs(secs);
        }
        if let Some(policy) = lookup("UPTANE_REGISTRATION_POLICY") {
            config.registration_policy = policy.parse()?;
        }

        Ok(config)
    }

    /// Jail for every download.
    pub fn targets_dir(&self) -> PathBuf {
        self.client_dir.join("targets")
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.client_dir.join("keys")
    }
}

fn socket_addr(name: &str, value: &str) -> Result<SocketAddr, UpdateError> {
    value
        .parse()
        .map_err(|e| UpdateError::Config(format!("{name}={value:?}: {e}")))
}

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}
