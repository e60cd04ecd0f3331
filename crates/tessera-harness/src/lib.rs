//! Deterministic simulation harness for the Tessera session layer.
//!
//! This crate provides simulated collaborators (message security, greeting,
//! channel server) and a [`World`] that runs several members against them on
//! a virtual clock, so that multi-party scenarios are reproducible.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod oracle;
pub mod sim_env;
pub mod sim_greeter;
pub mod sim_security;
pub mod sim_server;
pub mod world;

pub use sim_env::SimEnv;
pub use sim_greeter::{SimGreeter, SimGreeting};
pub use sim_security::{SimKey, SimSecurity, SimSecurityFactory};
pub use sim_server::SimServer;
pub use world::{Member, SimSession, World, WorldConfig};
