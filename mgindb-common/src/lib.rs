// mgindb-common - Shared wire vocabulary for MginDB clients
//
// This crate defines the text protocol codec, the error taxonomy and the
// plain data types exchanged between the codec and the client engine.

pub mod error;
pub mod protocol;
pub mod types;

// Re-export for convenience
pub use error::*;
pub use protocol::*;
pub use types::*;
