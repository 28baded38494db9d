use std::process;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use arkfleet::cli::{
    format_artifact, format_plan, format_validation, plan_file, render_cluster, validate_file, Cli,
    Commands, PlanArgs, RenderArgs, ServeArgs,
};
use arkfleet::cluster::{ConfigStore, FileStore};
use arkfleet::config::{default_config_path, load_config_from, GlobalConfig, ManagerConfig};
use arkfleet::server::{create_router, AppState, DataLayout};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = cli.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = match load_config_from(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config {}: {}", config_path.display(), e);
            process::exit(1);
        }
    };

    match cli.command {
        Commands::Serve(args) => serve(config, args).await,
        Commands::Plan(args) => plan(args),
        Commands::Render(args) => render(&config, args).await,
        Commands::Validate(args) => {
            let result = validate_file(&args.file);
            print!("{}", format_validation(&result));
            if !result.valid {
                process::exit(1);
            }
        }
    }
}

async fn serve(mut config: ManagerConfig, args: ServeArgs) {
    if let Some(bind_addr) = args.bind_addr {
        config.server.bind_addr = bind_addr;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    let state = match AppState::from_config(&config).await {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to initialise state: {}", e);
            process::exit(1);
        }
    };

    let addr = format!("{}:{}", config.server.bind_addr, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            process::exit(1);
        }
    };

    info!("arkfleet API listening on {}", addr);
    info!("Data directory: {}", config.data_dir);

    if let Err(e) = axum::serve(listener, create_router(state)).await {
        error!("Server error: {}", e);
        process::exit(1);
    }
}

fn plan(args: PlanArgs) {
    let cluster = match plan_file(&args.file) {
        Ok(cluster) => cluster,
        Err(e) => {
            error!("Failed to plan {}: {}", args.file.display(), e);
            process::exit(1);
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&cluster) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("Failed to serialize plan: {}", e);
                process::exit(1);
            }
        }
    } else {
        print!("{}", format_plan(&cluster));
    }
}

async fn render(config: &ManagerConfig, args: RenderArgs) {
    let global = load_global(config).await;
    let artifacts = match plan_file(&args.file)
        .and_then(|cluster| render_cluster(&cluster, args.server.as_deref(), &global))
    {
        Ok(artifacts) => artifacts,
        Err(e) => {
            error!("Failed to render {}: {}", args.file.display(), e);
            process::exit(1);
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&artifacts) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("Failed to serialize artifacts: {}", e);
                process::exit(1);
            }
        }
    } else {
        for artifact in &artifacts {
            println!("{}", format_artifact(artifact));
        }
    }
}

/// Global settings from the data dir, defaults when none are stored yet
async fn load_global(config: &ManagerConfig) -> GlobalConfig {
    let store = match config.data_path() {
        Ok(root) => FileStore::new(DataLayout::under(&root).store),
        Err(e) => {
            info!("Using default global config: {}", e);
            return GlobalConfig::default();
        }
    };
    store.get_global().await.unwrap_or_else(|e| {
        info!("Using default global config: {}", e);
        GlobalConfig::default()
    })
}
