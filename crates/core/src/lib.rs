pub mod config;
pub mod context;
pub mod engine;
pub mod kv_cache;
pub mod layers;
pub mod loader;
pub mod models;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
