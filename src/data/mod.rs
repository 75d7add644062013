//! Data layer module
//!
//! Handles all data persistence:
//! - Local accounts, posts and social graph (read by federation)
//! - Actor keypairs
//! - Federated follows, likes and archived posts

mod database;
mod models;

pub use database::Database;
pub use models::*;
