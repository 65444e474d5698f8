//! Shared utility functions for fleetsched.
//!
//! This module provides small helpers used across multiple modules.

pub mod sync;

pub use sync::{lock, read, write};
