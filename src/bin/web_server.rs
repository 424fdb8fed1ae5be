use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use dev_tutor::{
    ai_utils::OpenAiModel, api::router, config::Config, course::SqliteCourseStore, db,
    teacher::Tutor, utils::init_log,
};
use rustls::crypto::{CryptoProvider, ring};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about = "DevTutor HTTP server")]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
    /// Overrides `database.url`
    #[arg(short, long)]
    database: Option<String>,
    #[arg(short = 'H', long)]
    host: Option<String>,
    #[arg(short, long)]
    port: Option<u16>,
    /// Write daily rotated logs to this directory instead of stdout
    #[arg(short, long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_log(args.log_dir.clone())?;
    let mut config = Config::load(Some(args.config.as_path()))?;
    if let Some(database) = args.database {
        config.database.url = database;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if config.llm.api_key.is_empty() {
        anyhow::bail!("OPENAI_API_KEY is not set");
    }
    info!("{:?}", config);

    let database = db::connect(&config.database.url).await?;
    let model = Arc::new(OpenAiModel::new(&config.llm));
    let store = Arc::new(SqliteCourseStore::new(database.clone()));
    let tutor = Arc::new(Tutor::new(model, store, database, &config));
    let app = router(tutor)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid listen address")?;
    match (&config.server.tls_cert, &config.server.tls_key) {
        (Some(cert), Some(key)) => {
            CryptoProvider::install_default(ring::default_provider()).map_err(|e| {
                anyhow::anyhow!("Failed to initialize rustls crypto provider: {:?}", e)
            })?;
            let tls = RustlsConfig::from_pem_file(cert, key)
                .await
                .context("load TLS certificate")?;
            info!("listening on https://{}", addr);
            axum_server::bind_rustls(addr, tls)
                .serve(app.into_make_service())
                .await?;
        }
        _ => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!("listening on http://{}", addr);
            axum::serve(listener, app).await?;
        }
    }
    Ok(())
}
