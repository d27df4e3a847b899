//! trustflow: information-flow control for plugin boundaries.
//!
//! Tracks how far data can be trusted as it moves toward untrusted plugin
//! code, and derives request signals deterministically before policy code
//! reads them. Synchronous and in-memory: no I/O happens on the decision
//! path.
//!
//! See `DESIGN.md` for the module map.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;
pub mod types;

pub mod enrichment;
pub mod ifc;
