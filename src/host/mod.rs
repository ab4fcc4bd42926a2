//! Headless host surface: envelopes, command handling and the stdio bridge.

pub mod contract;
pub mod handler;
pub mod stdio;
