pub mod config;
pub mod discovery;
pub mod platform;
pub mod protocol;
pub mod record;

pub use protocol::TabId;
