// Library exports for the binary, integration tests and reusable components

pub mod app_context;
pub mod cache;
pub mod config;
pub mod db;
pub mod decode;
pub mod fingerprint;
pub mod format;
pub mod import;
pub mod playback;
pub mod preview;
pub mod store;

pub use app_context::{AppContext, AppError};

// Mocks shared by unit and integration tests (hidden from docs)
#[doc(hidden)]
pub mod test_support;
