//! Test doubles for the sideload host
//!
//! - [`FakeRegistry`]: an in-memory [`RegistryBridge`](sideload_kernel::RegistryBridge)
//!   that records every call and counts callback invocations
//! - [`ModuleImage`]: builds the textual module images `FakeRegistry` understands
//! - [`RecordingLog`]: a [`HostLog`](sideload_kernel::HostLog) that keeps every line

mod image;
mod log;
mod registry;

pub use image::{ConstructBehavior, MethodBehavior, ModuleImage};
pub use log::RecordingLog;
pub use registry::{BridgeCall, FakeRegistry};
