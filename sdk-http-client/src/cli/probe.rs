//! Performs a single `GET` with a client built from configuration.
use crate::cli::error::CliError;
use crate::client::HttpClient;
use crate::config::ClientConfiguration;
use crate::factory::create_http_client;
use clap::Parser;
use http::{Request, StatusCode};
use std::fmt;
use std::path::PathBuf;
use tracing::{Level, debug, info};

/// Builds an SDK HTTP client from configuration and performs a GET request to the provided url
#[derive(Debug, Parser)]
#[command(name = "sdk-http-probe")]
pub struct ProbeArgs {
    /// Path to the YAML client configuration. `SDK_HTTP_` prefixed environment variables are applied on top
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level upperbound
    #[arg(long, default_value = "info")]
    pub log_level: Level,

    /// Url to request
    pub url: String,
}

#[derive(Debug, PartialEq)]
pub struct ProbeResult {
    pub status: StatusCode,
    pub body_size: usize,
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status: {}, body: {} bytes", self.status, self.body_size)
    }
}

pub fn run(args: &ProbeArgs) -> Result<ProbeResult, CliError> {
    let config = ClientConfiguration::load(args.config.as_deref())
        .map_err(|err| CliError::Precondition(err.to_string()))?;
    debug!(path = ?args.config, "client configuration loaded");

    let client =
        create_http_client(&config).map_err(|err| CliError::Precondition(err.to_string()))?;

    let request = Request::get(args.url.as_str())
        .body(Vec::new())
        .map_err(|err| CliError::Precondition(format!("invalid url `{}`: {err}", args.url)))?;

    info!(url = %args.url, "sending request");
    let response = client
        .execute(request)
        .map_err(|err| CliError::Command(err.to_string()))?;

    Ok(ProbeResult {
        status: response.status(),
        body_size: response.body().len(),
    })
}
