pub mod application;
pub mod core;
pub mod data_layer;
pub mod discovery;
pub mod file_transfer;
pub mod infrastructure;
pub mod messaging;
pub mod network;
pub mod protocol;
pub mod utils;

// Re-export the types most callers need
pub use application::WearService;
pub use crate::core::{
    Channel, DataFilter, DataMap, DataValue, EventKind, Node, NodeId, StatusCode, Transport, TransportEvent, WearConsumer,
    WearEvent,
};
pub use crate::infrastructure::{AppConfig, ChannelConsumer, ConsumerRegistry, LoggingConsumer, SimEndpoint, SimNetwork};
