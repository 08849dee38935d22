use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use compass_extension::background::Background;
use compass_extension::cli::{stdio, Cli, Commands};
use compass_extension::config::ExtensionConfig;

fn init_tracing(level: &str) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = if cli.ephemeral {
        ExtensionConfig::ephemeral()
    } else {
        ExtensionConfig::load_or_default(&cli.config)
    };
    init_tracing(&config.logging.level);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Config => match toml::to_string_pretty(&config) {
            Ok(s) => println!("{}", s),
            Err(e) => error!("Unable to render config: {}", e),
        },
        Commands::Run => {
            let background = match Background::start(config).await {
                Ok(background) => background,
                Err(e) => {
                    error!("Failed to start background: {}", e);
                    std::process::exit(1);
                }
            };
            info!("Serving ports on stdin/stdout");
            if let Err(e) = stdio::serve(background, tokio::io::stdin(), tokio::io::stdout()).await {
                error!("Transport failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}
