pub mod api;
pub mod config;
pub mod device;
pub mod platform;
pub mod services;
