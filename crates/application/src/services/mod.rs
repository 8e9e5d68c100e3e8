pub mod discovery_service;

pub use discovery_service::DiscoveryService;
