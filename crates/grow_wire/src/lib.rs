pub mod error;
pub mod message;

pub use error::{ErrorKind, RemoteError};
pub use message::*;
