pub mod backoff;
pub mod constants;
pub mod envelope;
pub mod error;
pub mod model;

pub use backoff::Backoff;
pub use envelope::{Envelope, MessageKind};
pub use error::{ErrorKind, FleetError};

/// Wire protocol version. Bumped on any breaking change to `Envelope` or
/// the payload shapes carried inside it.
pub const PROTOCOL_VERSION: u8 = 1;
