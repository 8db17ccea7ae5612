//! Integration test entry point for beamlink-node.
//!
//! Every test talks to an in-process FakePeer over real sockets.
//! Run with: cargo test --test integration

mod harness;
mod backend;
mod connection;
mod mailbox;
mod rpc;
