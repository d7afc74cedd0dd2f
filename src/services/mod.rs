//! Device logic
//!
//! State machines and stores owned by the device loop. None of them touch
//! the hardware directly; collaborators from [`crate::platform`] are passed
//! in, which keeps everything here testable with fakes.

pub mod config_store;
pub mod connectivity;
pub mod control;
pub mod reboot;
pub mod status;
pub mod upload;
