pub mod aggregator;
pub mod cache;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod handlers;
pub mod health;
pub mod key_generator;
pub mod materializer;
pub mod middleware;
pub mod models;
pub mod postgres;
pub mod rate_limit_config;
pub mod rate_limiter;
pub mod redis;
pub mod response;
pub mod scoring;
pub mod server;
pub mod store;
pub mod syrup;
pub mod validation;
pub mod vote_queue;

pub use config::Config;
pub use error::{ApiError, Result};
pub use server::{create_app, Limiters, Server};
