use std::sync::Arc;

use async_trait::async_trait;
use update_engine::error::UpdateError;
use update_engine::rpc::{RpcHandler, RpcRequest, RpcResponse, Transport};

/// Calls a handler in the same process. Requests and responses still go
/// through their JSON encoding so both ends see exactly what the wire carries.
#[derive(Clone)]
pub struct InProcessTransport {
    handler: Arc<dyn RpcHandler>,
}

impl InProcessTransport {
    pub fn new(handler: Arc<dyn RpcHandler>) -> Self {
        InProcessTransport { handler }
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, UpdateError> {
        let request: RpcRequest = serde_json::from_slice(&serde_json::to_vec(&request)?)?;
        let response = self.handler.handle(request).await;
        Ok(serde_json::from_slice(&serde_json::to_vec(&response)?)?)
    }
}
