//! Beat note monitor for an R&S FSEB20 spectrum analyzer.
//!
//! The analyzer sits on a GPIB bus behind a Prologix USB adapter. This library
//! contains the transport stack, the analyzer driver, and the tracking loop
//! that keeps the display centered and zoomed on a phase-lock beat note while
//! publishing its frequency and linewidth.

pub mod adapters;
pub mod config;
pub mod counter;
pub mod error;
pub mod error_recovery;
pub mod instrument;
pub mod publish;
pub mod tracker;
