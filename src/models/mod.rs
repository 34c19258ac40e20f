mod click;
mod link;
mod protection;

pub use click::{ClickEvent, Device, NewClickEvent};
pub use link::Link;
pub use protection::{ProtectionInfo, ProtectionRecord};
