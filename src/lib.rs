pub mod bucket;
pub mod clock;
pub mod config;
pub mod controller;
pub mod cors;
pub mod error;
pub mod handlers;
pub mod health;
pub mod key_generator;
pub mod metrics;
pub mod middleware;
pub mod policy;
pub mod response;
pub mod server;
pub mod store;
pub mod sweeper;
pub mod validation;

pub use bucket::{Bucket, Decision};
pub use config::Config;
pub use controller::{AdmissionController, ControllerSettings, FailMode};
pub use error::{AdmissionError, Result, StoreError};
pub use handlers::AppState;
pub use policy::{Policy, PolicyTable};
pub use server::create_app;
pub use store::{BucketStore, MemoryStore, RedisStore};
