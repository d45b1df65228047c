/// HTTP server exposing pivot views to frontend clients
use actix_web::{error, middleware, web, App, HttpRequest, HttpResponse, HttpServer};
use log::info;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::EngineSettings;
use crate::memory::MemoryService;
use crate::messages::{ClientMessage, ServerMessage};
use crate::views::ViewRegistry;

/// Shared state for all requests
pub struct AppState {
    pub registry: Mutex<ViewRegistry<MemoryService>>,
}

impl AppState {
    pub fn new(service: MemoryService, settings: EngineSettings) -> Self {
        Self {
            registry: Mutex::new(ViewRegistry::new(Arc::new(service), settings)),
        }
    }
}

/// Pivot endpoint: one client message in, one server message out
async fn pivot(state: web::Data<AppState>, body: web::Json<ClientMessage>) -> HttpResponse {
    let mut msg = body.into_inner();
    let mut registry = state.registry.lock().await;
    if let Some(dashboard) = msg.dashboard_mut() {
        registry.service().fill_catalogue(dashboard);
    }
    match registry.handle(msg).await {
        reply @ ServerMessage::Error { .. } => HttpResponse::BadRequest().json(reply),
        reply => HttpResponse::Ok().json(reply),
    }
}

/// Measures and dimensions the data source offers
async fn catalogue(state: web::Data<AppState>) -> HttpResponse {
    let registry = state.registry.lock().await;
    let service = registry.service();
    HttpResponse::Ok().json(serde_json::json!({
        "measures": service.measure_specs(),
        "dimensions": service.dimension_specs(),
        "timeDimension": service.time_dimension(),
    }))
}

/// Health check endpoint
async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "message": "LivePivot server is running"
    }))
}

fn json_error(err: error::JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let reply = ServerMessage::Error {
        message: format!("Invalid message format: {}", err),
    };
    error::InternalError::from_response(err, HttpResponse::BadRequest().json(reply)).into()
}

/// Register the routes on an app
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error))
        .route("/pivot", web::post().to(pivot))
        .route("/catalogue", web::get().to(catalogue))
        .route("/health", web::get().to(health_check));
}

/// Start the HTTP server
pub async fn run_server(host: &str, port: u16, service: MemoryService, settings: EngineSettings) -> std::io::Result<()> {
    let state = web::Data::new(AppState::new(service, settings));

    info!("LivePivot server");
    info!("pivot endpoint: POST http://{}:{}/pivot", host, port);
    info!("catalogue: http://{}:{}/catalogue", host, port);
    info!("health check: http://{}:{}/health", host, port);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            // Enable logger
            .wrap(middleware::Logger::default())
            // CORS for development
            .wrap(
                actix_cors::Cors::default()
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
                    .max_age(3600),
            )
            .configure(configure)
    })
    .bind((host, port))?
    .run()
    .await
}
