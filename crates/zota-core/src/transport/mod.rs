//! Transport module - device command link abstraction.

pub mod mock;
pub mod traits;

pub use mock::MockTransport;
pub use traits::{OtaTransport, TransportError};
