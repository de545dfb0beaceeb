//! Worker node of a distributed code evaluation cluster.
//!
//! The worker registers itself at a central broker, receives evaluation
//! requests, downloads the submission archive, runs the tasks described by
//! the job recipe (trusted file operations in-process, untrusted commands
//! inside an OS-level sandbox) and ships the results back through the file
//! store. A token-based output judge is bundled for comparing program
//! output against reference output.

pub mod broker;
pub mod config;
pub mod fileman;
pub mod job;
pub mod judge;
pub mod sandbox;
pub mod task;
pub mod util;
