pub mod config;
pub mod paths;
pub mod permission;
pub mod request;
pub mod stream;
