//! Interception weaver.
//!
//! Takes a compiled [`loomir::program::ProgramUnit`], finds the methods and
//! types marked with interceptor attributes and rewrites their bodies so
//! every call goes through the interceptors' `OnEnter`, `OnException` and
//! `OnExit` hooks.
//!
//! A pass is driven by [`weaver::Weaver::weave`]: [`discovery`] collects the
//! attributions (after promoting type-wide attributes onto methods and
//! applying [`suppression`] rules), [`capability`] tells what each
//! interceptor type needs, and the weaver provisions fields and rewrites
//! bodies through the [`loomir::coder`] builder. Progress goes to the
//! [`wvlog`] channel; program units are loaded and stored through [`storage`].

pub mod capability;
pub mod discovery;
pub mod magic;
pub mod storage;
pub mod suppression;
#[cfg(any(test, feature = "test-utils"))]
pub mod tests_utils;
pub mod utils;
pub mod weaver;
pub mod wvlog;

pub extern crate chrono;
pub extern crate loomir;
