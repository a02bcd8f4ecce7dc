mod app;
mod bot;
mod completion;
mod config;
mod http;
mod line;
mod telemetry;

use crate::app::AppHandles;
use crate::config::AppConfig;
use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use std::path::PathBuf;

pub use crate::telemetry::TracingReloadHandle;

const VERSION: &str = env!("VERSION");

#[derive(Parser)]
#[command(name = "homework-bot")]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
#[command(version = VERSION)]
struct CliArguments {
    /// TOML config file, defaults to ./config.toml if present.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    dotenv().ok();

    // Logging depends on the config, so config errors go straight to stderr.
    let args = CliArguments::parse();
    let config = AppConfig::load(args.config)?;
    let tracing_reload = telemetry::init_tracing(&config.logging)?;

    #[cfg(feature = "sentry")]
    let _sentry_guard = config
        .sentry
        .as_ref()
        .map(telemetry::init_sentry)
        .transpose()?;

    #[cfg(not(feature = "sentry"))]
    let _sentry_guard: Option<()> = None;

    let sentry_enabled = _sentry_guard.is_some();
    let result: Result<()> = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async move {
            let handles = AppHandles::new(config, tracing_reload, sentry_enabled).await?;
            handles.run().await;
            Ok(())
        });

    #[cfg(feature = "sentry")]
    {
        if let Err(e) = &result {
            sentry_anyhow::capture_anyhow(e);
        }
        tracing::log::info!("Flushing Sentry events before shutdown...");
        if let Some(client) = sentry::Hub::current().client() {
            client.flush(Some(std::time::Duration::from_secs(5)));
        }
    }

    result
}
