// RDP token - library root

pub mod auth;
pub mod config;
pub mod error;
pub mod store;

pub use auth::{TokenManager, TokenRecord};
pub use error::{AuthError, Result};
pub use store::{FileTokenStore, MemoryTokenStore, TokenStore};
