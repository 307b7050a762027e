pub mod cold_path;
pub mod context;
pub mod heartbeat;
pub mod monitor;
pub mod oms;
pub mod pipeline;
pub mod policy;
pub mod router;
pub mod watchdog;
