//! Port-based IPC (§4.5): the only user-visible coordination primitive this
//! kernel exposes. Every user-space service (logger, block driver, VFS)
//! talks to its peers through ports opened here.

pub mod message;
pub mod port;

pub use port::{port_open, KERNEL_PORT, LOGGER_PORT};
