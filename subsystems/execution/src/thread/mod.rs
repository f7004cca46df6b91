//! # Thread Management
//!
//! Thread creation, lifecycle, and the per-environment thread ring.

pub mod registry;
pub mod states;
pub mod thread;

pub use states::*;
pub use thread::*;
