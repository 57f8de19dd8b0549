//! Integration test entry point for sluice-client.
//!
//! Run with: cargo test -p sluice-client --test integration

mod harness;
mod lifecycle;
