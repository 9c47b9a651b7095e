//! # sonar-server
//!
//! Host daemon for the sonar proximity exchange engine.
//!
//! This library provides the API handlers, configuration and state
//! management; the binary wires them to a listener.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod events;
pub mod logging;
pub mod settings;
pub mod state;
