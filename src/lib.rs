pub mod artifacts;
pub mod config;
pub mod features;
pub mod model;
pub mod predict;
pub mod server;
pub mod track;
pub mod train;

/// Application name for XDG paths
pub const APP_NAME: &str = "trailgrade";
