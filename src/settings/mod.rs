// Settings domain: per-camera persistence.

pub mod persistence;
pub mod store;
pub mod types;
