pub mod handler;
pub mod types;

pub use handler::{OutgoingStream, TransferEngine};
pub use types::{TransferSession, classify};
