//! Library crate for match-relay, exposing the hub modules to the binaries and tests.

pub mod config;
pub mod dto;
pub mod error;
pub mod routes;
pub mod services;
pub mod state;
