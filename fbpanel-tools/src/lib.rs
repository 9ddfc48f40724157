use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

/// Environment variable that takes precedence over `-s`.
pub const HOSTNAME_ENV: &str = "RASP_HOSTNAME";
/// Environment variable that takes precedence over `-k`.
pub const KEY_ENV: &str = "SSH_KEY";
pub const DEFAULT_KEY: &str = "key/panel.id_rsa";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Parser, Debug, Clone)]
pub struct ConfigOpts {
    /// Configuration file shared with the renderer
    #[arg(
        short = 'c',
        long = "config",
        default_value = "config.yaml",
        help = "Configuration file"
    )]
    pub config: PathBuf,

    #[arg(short = 'D', long = "debug", help = "Enable debug logging")]
    pub debug: bool,
}

/// Installs the global log subscriber. `RUST_LOG` wins over `debug`.
pub fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_writer(std::io::stderr)
        .init();
}

/// Picks the environment value when set and non-empty, else the flag.
pub fn env_override(var: &str, flag: Option<String>) -> Option<String> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .or(flag)
}
