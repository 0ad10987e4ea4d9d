//! gridpam -- anomaly extraction and outage signatures for distribution feeders.
//!
//! This crate provides rule classifiers for SCADA, AMI, eDNA and ticket
//! sources, rolling-window detectors for continuous points, and the
//! partitioned builder that turns cleaned anomalies into labelled feature
//! rows.

pub mod anomaly;
pub mod classify;
pub mod config;
pub mod detect;
pub mod error;
pub mod signature;
pub mod storage;
pub mod table;

pub use error::{PamError, Result};
