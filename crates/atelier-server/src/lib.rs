pub mod auth;
pub mod content;
pub mod dirs;
pub mod error;
pub mod gate;
pub mod handlers;
pub mod license;
pub mod notify;
pub mod otp;
pub mod server;
pub mod store;
pub mod upload;

use std::sync::Arc;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<gate::AuthGate>,
    pub content: content::ContentStore,
    pub uploads: upload::UploadPipeline,
    /// Mark issued cookies `Secure` (set behind HTTPS).
    pub secure_cookies: bool,
}

pub use server::{
    open_magic_links, read_key_file, resolve_admin_token, resolve_data_dir, router, run,
    ServerConfig,
};
