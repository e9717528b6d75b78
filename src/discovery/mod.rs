//! Hub discovery support

mod mdns;

pub use mdns::{MdnsAdvertiser, SERVICE_TYPE};
