//! # tessera
//!
//! Library half of the `tessera` binary: argument parsing, schema files and
//! command implementations, exposed so they can be tested without a process.

pub mod cli;
