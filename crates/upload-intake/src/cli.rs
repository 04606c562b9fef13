use std::path::PathBuf;

use clap::Parser;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "upload-intake", version = VERSION)]
pub struct Args {
    /// Path to the intake config file (TOML)
    pub config: PathBuf,
}
