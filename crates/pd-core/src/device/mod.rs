mod descriptor;
mod platform;

pub use descriptor::{DeviceContext, DeviceDescriptor};
pub use platform::Platform;
