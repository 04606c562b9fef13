//! Upload intake daemon.
//!
//! Watches the sshd auth log, the inbound drop directory and stdin for
//! uploaded audio, decides per contributor whether each file may enter the
//! broadcast pipeline, and hands admitted files to the converter's storage
//! directory.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use upload_intake::cli::Args;
use upload_intake::config::{IntakeConfig, IntakeSettings};
use upload_intake::runtime;

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,upload_intake=info")),
        )
        .init();

    let cfg = IntakeConfig::load(&args.config)?;
    let settings = IntakeSettings::from_config(&cfg)?;
    tracing::info!(
        config = %args.config.display(),
        inbound = %settings.inbound_dir.display(),
        storage = %settings.storage_dir.display(),
        ban_mode = ?settings.ban_mode,
        "starting upload intake"
    );
    runtime::run(settings, true)
}
