pub mod applier;
pub mod codec;
pub mod config;
pub mod controller;
pub mod protocol;
pub mod session;
pub mod status;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod watchdog;
