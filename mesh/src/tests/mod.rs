//! Internal tests module
//!
//! Integration tests that run real nodes over loopback TCP, plus an
//! in-process harness for the sync protocol. They have full access to
//! private crate internals.
