mod cgi;
mod config;
mod cycle;
mod error;
mod http;
mod redirect;
mod router;
mod server;

use config::Config;
use log::{error, info};
use std::env;
use std::process;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let config_path = if args.len() > 1 {
        &args[1]
    } else {
        "config.yaml"
    };

    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration from {}: {}", config_path, e);
            process::exit(1);
        }
    };

    info!("Starting server with config from {}", config_path);

    let mut server = match server::Server::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Error initializing server: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        error!("Server error: {}", e);
        process::exit(1);
    }
}
