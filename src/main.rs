//! Mock Rule Server - CLI Entry Point

use anyhow::{Context, Result};
use clap::Parser;
use mock_rule_server::{
    serve, AppState, MockEngine, SchemaValidator, ServerSettings, Store, TemplateRegistry,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "mock-rule-server",
    about = "Rule-driven HTTP mock server - project-scoped stubs, templated responses and latency simulation",
    version
)]
struct Args {
    /// Path to settings file
    #[arg(short, long, default_value = "mock-server.yaml")]
    config: PathBuf,

    /// Listen address, overriding the settings file
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Project index file, overriding the settings file
    #[arg(short, long, value_name = "PATH")]
    index: Option<PathBuf>,

    /// Serve only this project, at the root path
    #[arg(short, long)]
    project: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default settings and exit
    #[arg(long)]
    print_config: bool,

    /// Load the settings and every project, then exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print default settings if requested
    if args.print_config {
        let default_config = include_str!("../config/default-config.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    // Load settings
    let mut settings = if args.config.exists() {
        info!(path = ?args.config, "Loading settings");
        ServerSettings::from_file(&args.config)?
    } else {
        info!("Using default settings");
        ServerSettings::default()
    };
    if let Some(listen) = args.listen {
        settings.listen = listen;
    }
    if let Some(index) = args.index {
        settings.index_file = index;
    }
    if args.project.is_some() {
        settings.project = args.project;
    }
    settings.validate()?;

    let store = Store::open(&settings.index_file, Arc::new(SchemaValidator));

    // Validate and exit if requested
    if args.validate {
        let projects = store
            .list_projects()
            .await
            .with_context(|| format!("Failed to load {}", settings.index_file.display()))?;
        let rules: usize = projects.iter().map(|p| p.rules.len()).sum();
        println!(
            "Rules are valid ({} projects, {} rules defined)",
            projects.len(),
            rules
        );
        return Ok(());
    }

    let engine = MockEngine::new(
        Arc::clone(&store),
        TemplateRegistry::new(),
        settings.dispatch.clone(),
    );
    let state = Arc::new(AppState {
        engine,
        project: settings.project.clone(),
    });

    let listener = tokio::net::TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("Failed to bind {}", settings.listen))?;
    match &settings.project {
        Some(project) => info!(project = %project, "Serving single project at the root"),
        None => info!("Routing requests by project path prefix"),
    }

    serve(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Shutting down");
    })
    .await
    .context("Mock server failed")?;

    // Let pending rule file writes land before exiting
    store.flush().await?;

    Ok(())
}
