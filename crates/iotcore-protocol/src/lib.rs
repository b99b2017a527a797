pub mod api;
pub mod error;
pub mod shadows;
pub mod topics;

pub use api::*;
pub use error::{ProtocolError, ProtocolResult};
pub use shadows::*;
