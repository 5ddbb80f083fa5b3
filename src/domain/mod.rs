mod notification;
mod wire;

pub use notification::*;
pub use wire::*;
