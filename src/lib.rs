//! Load generation and streaming consumption against a topic service.
//!
//! [`roles::load::run_load`] spawns independent producer and consumer
//! workers, each on its own connection from a [`transport::ClientFactory`],
//! and joins all of them before returning.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod output;
pub mod payload;
pub mod rate;
pub mod roles;
pub mod transport;
