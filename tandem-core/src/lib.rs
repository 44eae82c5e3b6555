//! # tandem-core: operation model and transformation engine
//!
//! Pure, synchronous building blocks shared by the sync server and its
//! clients:
//!
//! - [`operation`]: retain/insert/delete operations, compose, invert, apply
//! - [`transform`]: operational transformation with client-id tie-break
//! - [`selection`]: cursors shifted through operations
//!
//! Nothing in this crate performs I/O or holds shared state.

pub mod error;
pub mod operation;
pub mod selection;
pub mod transform;

pub use error::OtError;
pub use operation::{ClientId, Component, Operation, Revision};
pub use selection::Selection;
pub use transform::{transform, transform_against};
