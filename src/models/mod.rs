mod message;
mod session;

pub use message::{ClientCommand, ServerEvent};
pub use session::{DeviceInfo, Session};
