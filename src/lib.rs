pub mod api;
pub mod auth;
pub mod blobstore;
pub mod broker;
pub mod classifier;
pub mod config;
pub mod db;
pub mod error;
pub mod firehose;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod pool;
pub mod stream;
pub mod subscription;
pub mod worker;
