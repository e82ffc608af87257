//! Thin wrappers around POSIX process primitives.

pub mod signal;
