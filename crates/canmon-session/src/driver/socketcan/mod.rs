//! SocketCAN bus driver (Linux only)
//!
//! Channel handle N maps to interface `{interface_prefix}{N-1}`, so with the
//! default prefix handle 1 is `can0`.

mod adapter;

pub use adapter::{interface_for, SocketCanDriver};
