//! Integration tests for canmon
//!
//! End-to-end scenarios that drive [`canmon_session::SessionManager`]
//! against the in-memory mock driver:
//!
//! - session lifecycle and channel handle reuse
//! - autoresponder output as written to the bus
//! - read faults, sink detachment and discovery reconcile
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p canmon-tests
//! ```
//!
//! # Test Structure
//!
//! - `session_e2e_test.rs` - Session manager scenarios with the mock driver

// This crate only contains tests, no library code
