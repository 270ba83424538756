pub mod config;
pub mod error;
pub mod schema;
pub mod types;
pub mod value;
