//! Serves a built dataset over HTTP.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use siacache::http;
use siacache::Server;

#[derive(Parser)]
#[command(name = "siacache-serve", about = "Serve a light-client index dataset")]
struct Args {
    /// Dataset directory written by the builder.
    #[arg(long)]
    files: PathBuf,

    /// Address to bind the HTTP server on.
    #[arg(long, default_value = "0.0.0.0:35813")]
    addr: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let server = match Server::open(&args.files) {
        Ok(server) => Arc::new(server),
        Err(err) => {
            tracing::error!(error = %err, "failed to open dataset");
            std::process::exit(1);
        }
    };

    let app = http::router(server);
    let listener = match tokio::net::TcpListener::bind(&args.addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, addr = %args.addr, "failed to bind");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %args.addr, "serving");
    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!(error = %err, "server exited");
        std::process::exit(1);
    }
}
