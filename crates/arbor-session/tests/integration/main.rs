//! Integration test entry point for arbor-session.
//!
//! Run with: cargo test -p arbor-session --test integration

mod harness;
mod scenario;
mod batching;
