use anyhow::Context;
use clap::{Parser, Subcommand};
use county_choropleth::config::AppConfig;
use county_choropleth::pipeline::Pipeline;
use county_choropleth::server::{self, AppState};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the whole pipeline: load, join, simplify, then publish or render
    Generate {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Upload an existing tile archive to the hosted tile service
    Publish {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        /// Archive to upload; defaults to the configured output archive
        #[arg(short, long, value_name = "FILE")]
        archive: Option<PathBuf>,
    },
    /// Write the direct-render map page
    Render {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        #[arg(short, long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Serve the map page, data table and point lookup API
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

fn load(config: &Path) -> anyhow::Result<Pipeline> {
    let app_config = AppConfig::load_from_file(config)?;
    let credentials = app_config.credentials();
    Ok(Pipeline::new(app_config, credentials))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Generate { config } => {
            info!(config = %config.display(), "generating map");
            let pipeline = load(config)?;
            let report = tokio::task::spawn_blocking(move || pipeline.run())
                .await
                .context("pipeline task panicked")??;
            info!(
                features = report.features,
                dropped = report.dropped,
                unmatched_rows = report.join.unmatched_rows.len(),
                vertices_before = report.simplify.vertices_before,
                vertices_after = report.simplify.vertices_after,
                "generation complete"
            );
            if let Some(receipt) = &report.upload {
                info!(tileset = %receipt.tileset_id, status = receipt.status, "published");
            }
            if let Some(html) = &report.html {
                info!(path = %html.display(), "map page ready");
            }
        }
        Commands::Publish { config, archive } => {
            let pipeline = load(config)?;
            let archive = archive.clone().unwrap_or_else(|| pipeline.archive_path());
            let receipt = tokio::task::spawn_blocking(move || pipeline.publish(&archive))
                .await
                .context("upload task panicked")??;
            info!(tileset = %receipt.tileset_id, status = receipt.status, "published");
        }
        Commands::Render { config, out } => {
            let pipeline = load(config)?;
            let out = out.clone().unwrap_or_else(|| pipeline.config().output.html_path());
            let path = tokio::task::spawn_blocking(move || {
                let prepared = pipeline.prepare()?;
                pipeline.render(&prepared, &out)
            })
            .await
            .context("render task panicked")??;
            info!(path = %path.display(), "map page ready");
        }
        Commands::Serve { config } => {
            info!(config = %config.display(), "serving map");
            let pipeline = load(config)?;
            let (state, pipeline) = tokio::task::spawn_blocking(move || {
                let prepared = pipeline.prepare()?;
                let state = AppState::build(prepared.collection, &prepared.orphan_rows, &pipeline.render_style()?)?;
                anyhow::Ok((state, pipeline))
            })
            .await
            .context("load task panicked")??;
            let app_config = pipeline.config();
            server::start_server(&app_config.server, &app_config.output.dir, state).await?;
        }
    }

    Ok(())
}
