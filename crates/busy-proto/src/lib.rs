pub mod channel;
pub mod config;
pub mod error;
pub mod platform;
pub mod protocol;
pub mod settings;
pub mod store;
pub mod sync;
pub mod volume;
