use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use update_engine::orchestrator::PrimaryEcu;
use update_engine::rpc::{RpcFault, RpcHandler, RpcRequest, RpcResponse};

/// Operations a Primary exposes to its Secondaries.
#[derive(Clone)]
pub struct PrimaryService {
    pub primary: Arc<PrimaryEcu>,
}

impl PrimaryService {
    pub fn new(primary: Arc<PrimaryEcu>) -> Self {
        PrimaryService { primary }
    }
}

#[async_trait]
impl RpcHandler for PrimaryService {
    async fn handle(&self, request: RpcRequest) -> RpcResponse {
        debug!(method = request.method(), "primary request");
        match request {
            RpcRequest::RegisterNewSecondary { serial, public_key } => RpcResponse::from_result(
                self.primary.register_secondary(&serial, public_key).map(|_| ()),
            ),
            RpcRequest::SubmitEcuManifest {
                vin,
                serial,
                nonce,
                signed_manifest,
            } => RpcResponse::from_result(
                self.primary
                    .register_ecu_manifest(&vin, &serial, nonce, signed_manifest)
                    .await,
            ),
            RpcRequest::RequestTimeAttestation { serial, signed_request } => {
                let attestation = self
                    .primary
                    .request_time_attestation(&serial, signed_request)
                    .await
                    .and_then(|attestation| attestation.to_value());
                match attestation {
                    Ok(value) => RpcResponse::TimeAttestation(value),
                    Err(e) => RpcResponse::Fault(RpcFault::from(&e)),
                }
            }
            other => RpcResponse::unsupported(other.method(), "primary"),
        }
    }
}
