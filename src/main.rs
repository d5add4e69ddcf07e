use actix_web::{web, App, HttpServer};
use log::{error, info, warn};

use policy_drive::api;
use policy_drive::app_state::AppState;
use policy_drive::config::AppConfig;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = log4rs::init_file(&config.logging.config_file, Default::default()) {
        env_logger::init();
        warn!("log4rs config {} unusable ({}), logging to stderr", config.logging.config_file, e);
    }

    let state = match AppState::from_config(config.clone()) {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to initialize application state: {}", e);
            std::process::exit(1);
        }
    };

    if config.sweeper.enabled {
        let sweeper = state.sweeper.clone();
        tokio::spawn(async move { sweeper.start().await });
    }

    info!("Starting server on {}:{}", config.server.host, config.server.port);
    let data = web::Data::new(state);
    let max_payload = config.server.max_payload_size;

    HttpServer::new(move || {
        App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(data.clone())
            .app_data(web::PayloadConfig::default().limit(max_payload))
            .configure(api::configure)
    })
    .workers(config.server.workers)
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await
}
