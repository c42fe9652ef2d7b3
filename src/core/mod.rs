pub mod cache;
pub mod credentials;
pub mod error;
pub mod models;
pub mod notifications;
pub mod pipeline;
pub mod retry;
pub mod settings;
pub mod store;
pub mod thresholds;
