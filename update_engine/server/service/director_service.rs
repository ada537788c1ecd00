use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use update_engine::director::Director;
use update_engine::rpc::{RpcHandler, RpcRequest, RpcResponse};

/// Operations the Director exposes: ECU registration and vehicle manifests.
#[derive(Clone)]
pub struct DirectorService {
    pub director: Arc<Director>,
}

impl DirectorService {
    pub fn new(director: Arc<Director>) -> Self {
        DirectorService { director }
    }
}

#[async_trait]
impl RpcHandler for DirectorService {
    async fn handle(&self, request: RpcRequest) -> RpcResponse {
        debug!(method = request.method(), "director request");
        match request {
            RpcRequest::RegisterEcuSerial { serial, public_key } => RpcResponse::from_result(
                self.director.register_ecu_serial(&serial, public_key).map(|_| ()),
            ),
            RpcRequest::SubmitVehicleManifest {
                vin,
                serial,
                signed_manifest,
            } => RpcResponse::from_result(
                self.director
                    .receive_vehicle_manifest(&vin, &serial, signed_manifest),
            ),
            other => RpcResponse::unsupported(other.method(), "director"),
        }
    }
}
