pub mod config;
pub mod events;
pub mod sim;

pub use config::*;
pub use events::*;
pub use sim::{SimEndpoint, SimNetwork};
