use std::env;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    if cmd != "serve" {
        eprintln!("Usage: bulwark serve --config <path>");
        std::process::exit(2);
    }

    let mut config_path = String::from("./config/example-config.yaml");
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(v) = args.next() {
                config_path = v;
            }
        }
    }

    let cfg = match bulwark_config::load_and_validate(&config_path) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = %e, path = %config_path, "failed to load config");
            std::process::exit(1);
        }
    };
    tracing::info!(
        watched_lists = cfg.watched_lists.len(),
        protected_rooms = cfg.protected_rooms.len(),
        dry_run = cfg.enforcement.dry_run,
        "starting bulwark"
    );

    if let Err(e) = bulwark_server::serve(cfg).await {
        tracing::error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}
