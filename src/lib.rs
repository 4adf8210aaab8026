//
// beaverctl - Lunatico Beaver observatory dome controller driver
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Driver for the Lunatico Beaver observatory dome controller.
//!
//! The driver is synchronous and poll-driven: starting an operation (a slew,
//! a home search, parking, a shutter move or a calibration) issues one serial
//! command, and the caller then invokes the matching `is_..._complete` method
//! periodically until it reports completion or an error. The driver is not
//! thread-safe; wrap it in a mutex if polled from multiple threads.
//!

pub mod args;
pub mod config;
pub mod dome;
