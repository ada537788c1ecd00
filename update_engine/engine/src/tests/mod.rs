mod consensus_tests;
mod cycle_tests;
mod manifest_tests;

use std::sync::Arc;

use async_trait::async_trait;

use crate::director::Director;
use crate::error::UpdateError;
use crate::orchestrator::PrimaryEcu;
use crate::rpc::{RpcRequest, RpcResponse, Transport};

/// Dispatches straight into a Primary context, round-tripping through JSON
/// the way a real transport would.
pub(crate) struct LoopbackPrimary(pub Arc<PrimaryEcu>);

#[async_trait]
impl Transport for LoopbackPrimary {
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, UpdateError> {
        let request: RpcRequest = serde_json::from_value(serde_json::to_value(&request)?)?;
        let primary = &self.0;
        let response = match request {
            RpcRequest::RegisterNewSecondary { serial, public_key } => {
                RpcResponse::from_result(primary.register_secondary(&serial, public_key).map(|_| ()))
            }
            RpcRequest::SubmitEcuManifest { vin, serial, nonce, signed_manifest } => RpcResponse::from_result(
                primary.register_ecu_manifest(&vin, &serial, nonce, signed_manifest).await,
            ),
            RpcRequest::RequestTimeAttestation { serial, signed_request } => {
                match primary.request_time_attestation(&serial, signed_request).await.and_then(|a| a.to_value()) {
                    Ok(value) => RpcResponse::TimeAttestation(value),
                    Err(e) => RpcResponse::Fault((&e).into()),
                }
            }
            other => RpcResponse::unsupported(other.method(), "primary"),
        };
        Ok(serde_json::from_value(serde_json::to_value(&response)?)?)
    }
}

pub(crate) struct LoopbackDirector(pub Arc<Director>);

#[async_trait]
impl Transport for LoopbackDirector {
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, UpdateError> {
        let director = &self.0;
        Ok(match request {
            RpcRequest::RegisterEcuSerial { serial, public_key } => {
                RpcResponse::from_result(director.register_ecu_serial(&serial, public_key).map(|_| ()))
            }
            RpcRequest::SubmitVehicleManifest { vin, serial, signed_manifest } => {
                RpcResponse::from_result(director.receive_vehicle_manifest(&vin, &serial, signed_manifest))
            }
            other => RpcResponse::unsupported(other.method(), "director"),
        })
    }
}

/// Never completes a call.
pub(crate) struct TimingOutTransport;

#[async_trait]
impl Transport for TimingOutTransport {
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, UpdateError> {
        Err(UpdateError::Timeout(request.method().to_string()))
    }
}
