pub mod error;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod types;
pub mod utils;
