pub mod api_types;
pub mod cache;
pub mod client;
pub mod error;
pub mod source;
pub mod types;
