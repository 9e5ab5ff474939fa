//! Command-line front-end (§10.5): a `clap`-derived flat struct carrying
//! the config file path plus overrides for the handful of knobs operators
//! tune most often, following the derive-struct style the rest of this
//! repository's own CLI front-ends use.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about = "Watches Twitch channels and captures their broadcasts to local storage")]
pub struct CliArgs {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "twitch-capture.toml")]
    pub config: PathBuf,

    /// Overrides the configured `RUST_LOG`-style filter directive.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Overrides the configured channel list (comma-separated logins).
    #[arg(long, value_delimiter = ',')]
    pub channels: Option<Vec<String>>,

    /// Overrides the configured download quality / rendition group id.
    #[arg(long)]
    pub quality: Option<String>,

    /// Overrides the configured output directory for finalized captures.
    #[arg(long)]
    pub output_dir: Option<String>,
}

impl CliArgs {
    pub fn overrides(&self) -> crate::config::Overrides {
        crate::config::Overrides {
            channels: self.channels.clone(),
            quality: self.quality.clone(),
            output_dir: self.output_dir.clone(),
        }
    }
}
