pub mod error;
pub mod manager;
pub mod result;
pub mod settings;
pub mod vision;
