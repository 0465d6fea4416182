//! Core types and logic shared between the portway host and its clients.
//!
//! This crate has no async runtime or process dependencies. It holds the
//! error taxonomy, the input sanitizer, the wire protocol spoken across
//! the dispatcher boundary and the terminal worker pipe, and the key
//! encoding table for terminal input.

pub mod error;
pub mod keys;
pub mod protocol;
pub mod sanitize;
