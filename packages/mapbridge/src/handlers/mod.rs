pub mod health;
pub mod projects;
pub mod websocket;

// Re-export all handlers for easy route registration
pub use health::{health_handler, health_live_handler, metrics_handler};
pub use projects::{delete_project, download_project, list_project_files};
pub use websocket::{app_ws_handler, plugin_ws_handler};
