//! # Rust Scope Core Library
//!
//! Hardware-timed experiment execution for laboratory microscopes. A user describes an
//! experiment (timepoints, a Z stack, illumination channels); the engine turns it into a
//! deterministic table of timed device actions, plays it on a timing executor, and collects the
//! resulting camera frames into ordered, annotated image planes.
//!
//! ## Crate Structure
//!
//! - **`config`**: TOML + environment configuration (`ScopeConfig`), loaded with figment.
//! - **`data`**: frame types, the data intake that resequences frames, and the plane writer.
//! - **`error`**: the `DaqError` enum shared by every layer.
//! - **`events`**: broadcast channels for frames, stage moves, state changes and device faults.
//! - **`experiment`**: spec, action table builder, timing compiler, executor client and the
//!   experiment engine.
//! - **`hardware`**: capability traits, the device registry and simulated devices.
//! - **`logging`**: `tracing-subscriber` setup.

pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod experiment;
pub mod hardware;
pub mod logging;
