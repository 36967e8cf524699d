//! RCA agent library: settings and the HTTP surface of the binary

pub mod api;
pub mod config;
