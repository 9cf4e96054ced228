pub mod config;
pub mod events;
pub mod models;
pub mod record;
pub mod stats;
