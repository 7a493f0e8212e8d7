#[cfg(feature = "cli")]
use clap::Parser;
#[cfg(feature = "cli")]
use sci_gateway::{config::Config, run_server};

#[cfg(feature = "cli")]
#[derive(Debug, Parser)]
#[command(name = "sci-gateway", version, about = "Multi-model scientific LLM routing gateway")]
struct Cli {
    /// Listen address (overrides API_HOST)
    #[arg(long, env = "API_HOST")]
    host: Option<String>,

    /// Listen port (overrides API_PORT)
    #[arg(long, env = "API_PORT")]
    port: Option<u16>,

    /// JSON file with backend descriptors (overrides BACKENDS_FILE)
    #[arg(long, env = "BACKENDS_FILE")]
    backends_file: Option<std::path::PathBuf>,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut cfg = Config::from_env()?;
    if let Some(host) = cli.host {
        cfg.api_host = host;
    }
    if let Some(port) = cli.port {
        cfg.api_port = port;
    }
    if let Some(path) = cli.backends_file {
        cfg.backends = Config::load_backends_file(&path)?;
        cfg.validate()?;
    }

    run_server(cfg).await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
