pub mod connection;
pub mod hub;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod router;
pub mod server;
