use std::sync::Arc;

use async_trait::async_trait;
use update_engine::orchestrator::SecondaryEcu;
use update_engine::rpc::{RpcHandler, RpcRequest, RpcResponse};

/// A Secondary only accepts what its Primary pushes to it.
#[derive(Clone)]
pub struct SecondaryService {
    pub secondary: Arc<SecondaryEcu>,
}

impl SecondaryService {
    pub fn new(secondary: Arc<SecondaryEcu>) -> Self {
        SecondaryService { secondary }
    }
}

#[async_trait]
impl RpcHandler for SecondaryService {
    async fn handle(&self, request: RpcRequest) -> RpcResponse {
        match request {
            RpcRequest::RelayFromPrimary { payload } => {
                RpcResponse::from_result(self.secondary.receive_relay(payload))
            }
            other => RpcResponse::unsupported(other.method(), "secondary"),
        }
    }
}
