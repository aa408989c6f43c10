//! Storage backends and the services built on them.

pub mod blob_store;
pub mod clock;
pub mod error;
pub mod metadata;
pub mod object_service;
pub mod sweeper;
