/// LivePivot Server
///
/// Standalone server that evaluates pivot views over an in-memory dataset
/// for frontend clients.

use livepivot::server::run_server;
use livepivot::{EngineSettings, MemoryService};
use log::{error, info};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    // Get host and port from environment or use defaults
    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = match std::env::var("PORT").unwrap_or_else(|_| "8080".to_string()).parse() {
        Ok(port) => port,
        Err(err) => {
            error!("PORT must be a number: {}", err);
            std::process::exit(2);
        }
    };

    let settings = match EngineSettings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            error!("{}", err);
            std::process::exit(2);
        }
    };

    let service = match std::env::var("PIVOT_DATASET") {
        Ok(path) => {
            info!("loading dataset from {}", path);
            std::fs::read_to_string(&path)
                .map_err(|err| err.to_string())
                .and_then(|json| MemoryService::from_json(&json).map_err(|err| err.to_string()))
        }
        Err(_) => MemoryService::demo().map_err(|err| err.to_string()),
    };
    let service = match service {
        Ok(service) => service,
        Err(err) => {
            error!("failed to load dataset: {}", err);
            std::process::exit(1);
        }
    };

    // Start the server
    run_server(&host, port, service, settings).await
}
