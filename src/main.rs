use std::sync::Arc;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use prometheus::{Encoder, TextEncoder};

use sonarr_operator::controllers::sonarr;
use sonarr_operator::registry::{HttpRegistryClient, RegistryCredentials};
pub use sonarr_operator::{self, telemetry, Metrics, State};

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Only manage Sonarr resources in this namespace; all namespaces when unset
    #[arg(long = "watch-namespace", env = "WATCH_NAMESPACE", value_name = "NAMESPACE")]
    watch_namespace: Option<String>,

    /// Username for registries that need authentication to read manifests
    #[arg(long = "registry-username", env = "REGISTRY_USERNAME", requires = "registry_password")]
    registry_username: Option<String>,

    #[arg(long = "registry-password", env = "REGISTRY_PASSWORD", hide_env_values = true)]
    registry_password: Option<String>,

    #[arg(long = "bind-address", env = "BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    bind_address: String,
}

impl Arguments {
    fn registry_credentials(&self) -> Option<RegistryCredentials> {
        Some(RegistryCredentials {
            username: self.registry_username.clone()?,
            password: self.registry_password.clone()?,
        })
    }
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init().await;

    let args: Arguments = Arguments::parse();

    // Initiatilize Kubernetes controller state
    let state = State::default();
    let operator_metrics = Metrics::default().register(&state.registry)?;
    let client = kube::Client::try_default().await?;
    let registry = Arc::new(HttpRegistryClient::new(args.registry_credentials()));

    let controller = sonarr::run(
        client,
        operator_metrics,
        state.clone(),
        args.watch_namespace.clone(),
        registry,
    );
    tokio::pin!(controller);

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(&args.bind_address)?
    .shutdown_timeout(5)
    .run();

    tokio::pin!(server);

    // Both runtimes implements graceful shutdown, so poll until both are done
    tokio::join!(controller, server).1?;
    Ok(())
}
