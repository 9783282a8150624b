//! HTTP surface: page rendering, the virtual REST namespaces, generated
//! image files and the `/__mirage` operator routes.

pub mod admin;
pub mod error;
pub mod render;
pub mod request;
pub mod rest;
pub mod server;

#[cfg(test)]
mod test_support;

pub use error::ApiError;
pub use server::{build_router, start, AppState, ImageSettings, RuntimeOptions, ServerConfig, ServerHandle};
