// fbpanel-healthz
//
// Liveness probe for fbpanel-display: succeeds while the display heartbeat
// is younger than two update intervals.

use clap::Parser;
use fbpanel::report::Heartbeat;
use fbpanel::Config;
use fbpanel_tools::{init_logging, ConfigOpts};
use std::process::ExitCode;
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(name = "fbpanel-healthz", version, about = "Check the display heartbeat")]
struct Cli {
    #[command(flatten)]
    opts: ConfigOpts,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.opts.debug);

    let config = match Config::load(&cli.opts.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let heartbeat = Heartbeat::new(&config.liveness.file.display);
    let max_age = config.update_interval() * 2;
    match heartbeat.age() {
        Ok(age) if age <= max_age => {
            debug!(age = age.as_secs_f64(), "heartbeat fresh");
            info!("OK.");
            ExitCode::SUCCESS
        }
        Ok(age) => {
            error!(
                path = %heartbeat.path().display(),
                age = age.as_secs_f64(),
                max_age = max_age.as_secs_f64(),
                "display has not been updated"
            );
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(path = %heartbeat.path().display(), error = %e, "heartbeat unreadable");
            ExitCode::FAILURE
        }
    }
}
