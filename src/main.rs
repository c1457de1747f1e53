use std::{path::PathBuf, sync::Arc};

use ::tracing::{error, info_span};
use clap::Parser;
use service::Service;

mod alerts;
mod config;
mod data_model;
mod monitor;
mod processor;
mod queue;
mod service;
mod store;
mod tracing;
mod transport;
use tracing::setup_tracing;
mod utils;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => config::ServerConfig::from_path(path.to_str().unwrap()).unwrap(),
        None => config::ServerConfig::default(),
    };

    setup_tracing(&config)
        .inspect_err(|e| {
            error!("Error setting up tracing: {:?}", e);
        })
        .unwrap();

    let root_span = info_span!("allocstats", env = config.env);
    let _guard = root_span.enter();

    let subscriptions = match transport::BrokerSubscriptions::connect(&config.transport_url).await {
        Ok(subscriptions) => Arc::new(subscriptions),
        Err(err) => {
            error!("Error connecting to the notification broker: {:?}", err);
            std::process::exit(1);
        }
    };

    let service = match Service::new(config, subscriptions).await {
        Ok(service) => service,
        Err(err) => {
            error!("Error creating service: {:?}", err);
            std::process::exit(1);
        }
    };
    if let Err(err) = service.start().await {
        error!("Error starting service: {:?}", err);
        std::process::exit(1);
    }
}
