mod class;
mod ctrl;
mod error;
mod group;
mod ign;
mod proto;

pub use class::{DeviceClass, DEVICE_NAME};
pub use ctrl::CtrlHandle;
pub use error::DeviceError;
pub use group::{GroupCanceller, GroupHandle};
pub use ign::IgnoreHandle;
pub use proto::{CTRL_WRITE_MAX, GROUP_READ_MIN};
