pub mod core;
pub mod http;
pub mod logging;
pub mod socket;
pub mod store;
pub mod subscribers;
pub mod tabs;
