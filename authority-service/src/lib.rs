pub mod config;
pub mod db;
pub mod dtos;
pub mod error;
pub mod models;
pub mod services;
pub mod store;

pub use error::{AuthorityError, AuthorityResult};
pub use services::Authority;
