//! Request pipeline layers.

pub mod access_log;
pub mod auth_filter;
pub mod request_logger;

pub use access_log::access_log;
pub use auth_filter::auth_filter;
pub use request_logger::request_logger;
