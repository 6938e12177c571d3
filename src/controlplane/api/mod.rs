//! API Module
//!
//! REST API over the control plane and the server hosting it.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
