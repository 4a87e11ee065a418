//! Core traits, types, and constants.
//!
//! This module provides the foundational contracts of the relay and has no
//! dependency on the transport layer.

mod constants;
mod error;
mod traits;

pub use constants::*;
pub use error::*;
pub use traits::*;
