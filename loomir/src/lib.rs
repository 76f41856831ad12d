//! Typed, mutable instruction-level IR for post-compilation weaving.
//!
//! The crate models an already-compiled program unit (types, methods,
//! fields, custom attributes and stack-machine method bodies) and offers the
//! tools needed to rewrite it in place:
//!
//! - [`program`]: the program unit and its members, with pattern queries
//!   (`find_*_by_attributes`), generic resolution and hierarchy walks.
//! - [`body`]: instruction streams with stable [`body::InstrId`] handles and
//!   exception regions that stay consistent across structural edits.
//! - [`coder`]: a fluent builder emitting structured code (if/then,
//!   try/catch/finally, boolean expressions) into a method body.
//! - [`analysis`]: stack-balance verification of method bodies.
//! - `interp` (feature `test-utils`): a small reference interpreter used to
//!   observe the behaviour of rewritten code.
#![allow(clippy::new_without_default)]

pub mod analysis;
pub mod body;
pub mod coder;
pub mod fmt;
#[cfg(any(test, feature = "test-utils"))]
pub mod interp;
pub mod program;
pub mod types;
pub mod utils;
