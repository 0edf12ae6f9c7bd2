//! Small shared helpers.

pub mod filename;
pub mod http_client;
