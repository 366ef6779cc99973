//! Hardware abstraction layer.
//!
//! Devices are reached through capability traits (`Camera`, `LightSource`, `StageAxis`,
//! `TimingExecutor`), looked up by role in the [`registry::DeviceRegistry`]. The `mock` module
//! provides simulated devices driven by the simulated executor's output lines.

pub mod capabilities;
pub mod mock;
pub mod registry;

pub use capabilities::{Armable, Camera, LightSource, StageAxis, TimingExecutor};
pub use registry::{DeviceId, DeviceRegistry};
