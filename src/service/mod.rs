//! Service layer
//!
//! Orchestrates storage and federation for operations triggered by the
//! owning application rather than by remote servers.

mod publish;

pub use publish::PublishService;
