//! # SDK HTTP client library
//!
//! Builds the blocking HTTP client used by the SDK transport layer out of a [config::ClientConfiguration]:
//! connection pooling limits, TLS, proxy, gzip and the fixed no-redirect/no-retry policy. The entry point is
//! [factory::create_http_client].

pub mod auth;
pub mod builder;
pub mod cli;
pub mod client;
pub mod config;
pub mod executor;
pub mod factory;
pub mod interceptor;
pub mod policy;
pub mod pool;
pub mod socket;
pub mod tls;
