use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use seccion_mapper::config::AppConfig;
use seccion_mapper::{pipeline, server};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the per-district sections KMZ
    Convert {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Export filtered tables, KMZ, GeoJSON and the standalone map page
    Export {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Serve the interactive map with section lookup
    Serve {
        #[command(flatten)]
        common: CommonArgs,
        /// Listen port, overriding the configured one
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[derive(Args)]
struct CommonArgs {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,
    /// Cartography ZIP to process, overriding the configured input
    #[arg(short, long, value_name = "ZIP")]
    input: Option<PathBuf>,
    /// Output directory for the generated artifacts
    #[arg(short, long, value_name = "DIR")]
    out_dir: Option<PathBuf>,
}

fn load_config(args: &CommonArgs) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::parse_file(&args.config)?;
    if let Some(zip) = &args.input {
        config.input.zip = Some(zip.clone());
        config.input.sections = None;
    }
    if let Some(dir) = &args.out_dir {
        config.output.dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Convert { common } => {
            let config = load_config(&common)?;
            pipeline::run_convert(&config)?;
        }
        Commands::Export { common } => {
            let config = load_config(&common)?;
            pipeline::run_export(&config)?;
        }
        Commands::Serve { common, port } => {
            let mut config = load_config(&common)?;
            if let Some(port) = port {
                config.server.port = port;
            }
            let inputs = pipeline::load_inputs(&config)?;
            server::start_server(&config, inputs.sections, &inputs.section_cols, inputs.blocks)
                .await?;
        }
    }

    Ok(())
}
