//! Process entry point: parses the CLI surface, brings the engine up and
//! serves the HTTP/SSE boundary over it until the process is killed.

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use kordon_core::{CliArgs, CollaboratorHooks, Config, Engine};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    let args = CliArgs::parse();
    let config = match Config::from_cli(args) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            std::process::exit(2);
        }
    };

    let port = config.port;
    // Collaborators (Helm, traffic, metrics) are out of scope here; the
    // hooks are wired up by embedders that build on top of the core.
    let engine = match Engine::start(config, CollaboratorHooks::default()).await {
        Ok(engine) => engine,
        Err(err) => {
            tracing::error!(error = %err, "engine failed to start");
            std::process::exit(1);
        }
    };

    let app = kordon_core::http::router(engine);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "kordon listening");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, %addr, "failed to bind");
            std::process::exit(1);
        }
    };

    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!(error = %err, "server exited with error");
        std::process::exit(1);
    }
}
