//! Typed request/response contract for the remote operations each role
//! exposes, plus the capabilities that carry them.
//!
//! Signed envelopes travel as raw JSON values so that the receiving side does
//! the schema check at its own boundary.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::crypto::keys::PublicKey;
use crate::error::UpdateError;
use crate::types::{EcuSerial, Nonce, Vin};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum RpcRequest {
    /// Director: bind an ECU serial to its public key.
    RegisterEcuSerial { serial: EcuSerial, public_key: PublicKey },
    /// Primary: declare an attached Secondary.
    RegisterNewSecondary {
        serial: EcuSerial,
        #[serde(default)]
        public_key: Option<PublicKey>,
    },
    /// Primary: a Secondary's signed ECU manifest for the current nonce.
    SubmitEcuManifest {
        vin: Vin,
        serial: EcuSerial,
        nonce: Nonce,
        signed_manifest: Value,
    },
    /// Director: the Primary's signed vehicle manifest.
    SubmitVehicleManifest {
        vin: Vin,
        serial: EcuSerial,
        signed_manifest: Value,
    },
    /// Secondary: metadata or an image pushed by the Primary.
    RelayFromPrimary { payload: RelayPayload },
    /// Primary: sign the time together with this Secondary's current nonce.
    /// `signed_request` is a `TimeRequest` signed by the Secondary's key.
    RequestTimeAttestation { serial: EcuSerial, signed_request: Value },
}

impl RpcRequest {
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::RegisterEcuSerial { .. } => "register_ecu_serial",
            RpcRequest::RegisterNewSecondary { .. } => "register_new_secondary",
            RpcRequest::SubmitEcuManifest { .. } => "submit_ecu_manifest",
            RpcRequest::SubmitVehicleManifest { .. } => "submit_vehicle_manifest",
            RpcRequest::RelayFromPrimary { .. } => "relay_from_primary",
            RpcRequest::RequestTimeAttestation { .. } => "request_time_attestation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "body", rename_all = "snake_case")]
pub enum RpcResponse {
    Ack,
    TimeAttestation(Value),
    Fault(RpcFault),
}

impl RpcResponse {
    pub fn from_result(result: Result<(), UpdateError>) -> Self {
        match result {
            Ok(()) => RpcResponse::Ack,
            Err(e) => RpcResponse::Fault(RpcFault::from(&e)),
        }
    }

    pub fn unsupported(method: &str, role: &str) -> Self {
        RpcResponse::Fault(RpcFault {
            kind: FaultKind::Unsupported,
            message: format!("{role} does not expose {method}"),
        })
    }
}

/// Why a remote call was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Schema,
    Signature,
    StaleNonce,
    IdentityConflict,
    UnknownEcu,
    TimeRegression,
    Unsupported,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFault {
    pub kind: FaultKind,
    pub message: String,
}

impl RpcFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        RpcFault {
            kind,
            message: message.into(),
        }
    }

    /// The local error a caller sees for this fault.
    pub fn into_error(self) -> UpdateError {
        match self.kind {
            FaultKind::Schema => UpdateError::Schema(self.message),
            FaultKind::Signature => UpdateError::Signature(self.message),
            FaultKind::StaleNonce => UpdateError::StaleNonce(self.message),
            FaultKind::IdentityConflict => UpdateError::IdentityConflict(self.message),
            FaultKind::UnknownEcu => UpdateError::UnknownEcu(self.message),
            FaultKind::TimeRegression => UpdateError::TimeRegression(self.message),
            FaultKind::Unsupported => UpdateError::Transport(self.message),
            FaultKind::Internal => UpdateError::Internal(self.message),
        }
    }
}

impl From<&UpdateError> for RpcFault {
    fn from(error: &UpdateError) -> Self {
        let kind = match error {
            UpdateError::Schema(_) => FaultKind::Schema,
            UpdateError::Signature(_) => FaultKind::Signature,
            UpdateError::StaleNonce(_) => FaultKind::StaleNonce,
            UpdateError::IdentityConflict(_) => FaultKind::IdentityConflict,
            UpdateError::UnknownEcu(_) => FaultKind::UnknownEcu,
            UpdateError::TimeRegression(_) => FaultKind::TimeRegression,
            _ => FaultKind::Internal,
        };
        // Carry the inner message so the round trip does not double the prefix.
        let message = match error {
            UpdateError::Schema(m)
            | UpdateError::Signature(m)
            | UpdateError::StaleNonce(m)
            | UpdateError::IdentityConflict(m)
            | UpdateError::UnknownEcu(m)
            | UpdateError::TimeRegression(m) => m.clone(),
            other => other.to_string(),
        };
        RpcFault { kind, message }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Metadata,
    Image,
}

/// Opaque content the Primary forwards to a Secondary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPayload {
    pub kind: PayloadKind,
    pub filepath: String,
    #[serde(serialize_with = "encode_base64", deserialize_with = "decode_base64")]
    pub content: Vec<u8>,
}

fn encode_base64<S: Serializer>(content: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(content))
}

fn decode_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD.decode(encoded).map_err(serde::de::Error::custom)
}

/// Outbound side: carries one request to a remote role and returns its answer.
/// Implementations must bound every call with a timeout.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, UpdateError>;
}

/// Inbound side: one role's fixed set of operations.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, request: RpcRequest) -> RpcResponse;
}

/// Sends `request` and expects a plain acknowledgement.
pub async fn call_expecting_ack(transport: &dyn Transport, request: RpcRequest) -> Result<(), UpdateError> {
    let method = request.method();
    match transport.call(request).await? {
        RpcResponse::Ack => Ok(()),
        RpcResponse::Fault(fault) => Err(fault.into_error()),
        other => Err(UpdateError::Transport(format!(
            "unexpected response to {method}: {other:?}"
        ))),
    }
}
