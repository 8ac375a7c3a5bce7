pub mod agent;
pub mod client;
pub mod config_store;
pub mod daemon;
pub mod hooks;
pub mod ipc;
pub mod runtime_store;
