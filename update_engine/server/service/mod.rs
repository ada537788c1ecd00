//! Manifest Transport Router: one handler per role, a framed TCP listener to
//! serve them and a TCP client transport to reach them.

pub mod director_service;
pub mod listener;
pub mod local;
pub mod primary_service;
pub mod relay;
pub mod secondary_service;

pub use director_service::DirectorService;
pub use listener::{RpcListener, StartOutcome};
pub use local::InProcessTransport;
pub use primary_service::PrimaryService;
pub use relay::TcpTransport;
pub use secondary_service::SecondaryService;

use tokio_util::codec::LengthDelimitedCodec;

/// Largest request or response frame accepted on the wire.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length-prefixed frames, each carrying one JSON request or response.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}
