//! Integration tests entry point
//!
//! Runs the master tier against in-memory backends and drives it the way
//! services and slaves do:
//! - Registration to failure alarm, in process
//! - Slave collector talking to the master over HTTP
//! - Flap suppression over a live tree watcher

mod common;
mod integration_tests;
