// ambient_wx_exporter - Prometheus metrics exporter for the Ambient Weather API
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use ambient_wx_exporter::client::{AmbientClient, ClientError, DeviceSource};
use ambient_wx_exporter::config::Config;
use ambient_wx_exporter::http::RequestState;
use ambient_wx_exporter::metrics::{ExporterMetrics, MetricOptions, DEFAULT_METRIC_PREFIX};
use ambient_wx_exporter::poll::{PollLoop, DEFAULT_PERIOD};
use chrono::Utc;
use clap::Parser;
use prometheus_client::registry::Registry;
use reqwest::{Client, Url};
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::oneshot;
use tracing::Level;

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 9876);
const DEFAULT_TIMEOUT_MILLIS: u64 = 5000;
const DEFAULT_API_URL: &str = "https://rt.ambientweather.net/v1/";

#[derive(Debug, Parser)]
#[clap(name = "ambient_wx_exporter", version = clap::crate_version!())]
struct AmbientExporterApplication {
    /// Ambient Weather application key
    app_key: String,

    /// Ambient Weather API key
    api_key: String,

    /// Base URL for the Ambient Weather API
    #[clap(long, default_value = DEFAULT_API_URL)]
    api_url: Url,

    /// Path to a JSON file mapping fields of particular devices to custom gauges
    #[clap(long)]
    config_file: Option<PathBuf>,

    /// Prefix for the name of every metric emitted
    #[clap(long, default_value_t = DEFAULT_METRIC_PREFIX.into())]
    metric_prefix: String,

    /// Don't emit a gauge for every well known field reported by the API
    #[clap(long)]
    disable_default_gauges: bool,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Fetch device data from the Ambient Weather API at this interval, in seconds.
    #[clap(long, default_value_t = DEFAULT_PERIOD.as_secs(), value_parser = clap::value_parser!(u64).range(1..))]
    refresh_secs: u64,

    /// Timeout for fetching device data from the Ambient Weather API, in milliseconds.
    #[clap(long, default_value_t = DEFAULT_TIMEOUT_MILLIS)]
    timeout_millis: u64,

    /// Address to bind to. By default, ambient_wx_exporter will bind to public address since
    /// the purpose is to expose metrics to an external system (Prometheus or another
    /// agent for ingestion)
    #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = AmbientExporterApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let config = match &opts.config_file {
        Some(path) => Config::from_path(path).unwrap_or_else(|e| {
            tracing::error!(message = "unable to load config", path = %path.display(), error = %e);
            process::exit(1)
        }),
        None => Config::default(),
    };

    let metric_opts = MetricOptions {
        prefix: opts.metric_prefix.clone(),
        default_gauges: !opts.disable_default_gauges,
    };

    let mut registry = Registry::default();
    let metrics = Arc::new(ExporterMetrics::new(&config, &metric_opts, &mut registry).unwrap_or_else(|e| {
        tracing::error!(message = "invalid gauge configuration", error = %e);
        process::exit(1)
    }));

    let timeout = Duration::from_millis(opts.timeout_millis);
    let http_client = Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        tracing::error!(message = "unable to initialize HTTP client", error = %e);
        process::exit(1)
    });

    let client = AmbientClient::new(http_client, opts.api_url.clone(), &opts.app_key, &opts.api_key)
        .unwrap_or_else(|e| {
            tracing::error!(message = "unable to initialize API client", error = %e);
            process::exit(1)
        });

    // Make an initial request for device data. This allows us to verify that the keys
    // the user provided are valid before starting the HTTP server and running indefinitely.
    // Data from this request is recorded right away and the first polling cycle happens
    // one period later, the API only allows one request per second.
    match client.devices().await {
        Err(ClientError::Unauthorized(status)) => {
            tracing::error!(message = "invalid application or API key", status = %status);
            process::exit(1)
        }
        Err(e) => {
            tracing::warn!(message = "failed to fetch initial device data", error = %e);
        }
        Ok(devices) => {
            tracing::info!(message = "verified API keys", devices = devices.len());
            metrics.record_all(&devices, Utc::now());
        }
    }

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let poll = PollLoop::new(client, metrics, Duration::from_secs(opts.refresh_secs)).delay_first_cycle();
    let poller = tokio::spawn(poll.run(async move {
        let _ = stop_rx.await;
    }));

    let context = Arc::new(RequestState { registry });
    let app = ambient_wx_exporter::http::router(context);
    let server = axum::Server::try_bind(&opts.bind).unwrap_or_else(|e| {
        tracing::error!(message = "error binding to address", address = %opts.bind, error = %e);
        process::exit(1)
    });

    tracing::info!(message = "server started", address = %opts.bind);
    server
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            // Wait for either SIGTERM or SIGINT to shutdown
            tokio::select! {
                _ = sigterm() => {}
                _ = sigint() => {}
            }
        })
        .await?;

    let _ = stop_tx.send(());
    poller.await?;

    tracing::info!("server shutdown");
    Ok(())
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}
