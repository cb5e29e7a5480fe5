pub mod services;

pub use services::WearService;
