// fbpanel-display
//
// Renders the panel image on a schedule and shows it on the remote
// framebuffer display.
//
// Run:  fbpanel-display -c config.yaml -s raspberrypi.local
// Stop: SIGTERM / Ctrl-C (takes effect between cycles)

use clap::Parser;
use fbpanel::cycle::{install_signal_handlers, SupervisorOptions};
use fbpanel::render::process;
use fbpanel::report::{CommandNotifier, JsonLinesMetrics, MetricsSink, NullMetrics};
use fbpanel::{Config, Dispatcher, RefreshScheduler, ShutdownToken, Supervisor};
use fbpanel_tools::{env_override, init_logging, ConfigOpts, DEFAULT_KEY, HOSTNAME_ENV, KEY_ENV};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "fbpanel-display",
    version,
    about = "Render the panel image and push it to a framebuffer display"
)]
struct Cli {
    #[command(flatten)]
    opts: ConfigOpts,

    /// Display host; RASP_HOSTNAME takes precedence
    #[arg(short = 's', long = "host", help = "Display host name")]
    host: Option<String>,

    /// Private key for the display host; SSH_KEY takes precedence
    #[arg(short = 'k', long = "key", help = "SSH private key")]
    key: Option<PathBuf>,

    #[arg(short = 'S', long = "small", help = "Small display mode")]
    small: bool,

    #[arg(short = 't', long = "test", help = "Test mode")]
    test: bool,

    #[arg(short = 'O', long = "once", help = "Display once and exit")]
    once: bool,
}

fn metrics_sink(config: &Config) -> Box<dyn MetricsSink> {
    let Some(path) = &config.metrics.data else {
        return Box::new(NullMetrics);
    };
    match JsonLinesMetrics::open(path) {
        Ok(sink) => Box::new(sink),
        Err(e) => {
            warn!(error = %e, "metrics disabled");
            Box::new(NullMetrics)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.opts.debug);

    let Some(host) = env_override(HOSTNAME_ENV, cli.host.clone()) else {
        error!("display host is required (-s HOST or {})", HOSTNAME_ENV);
        return ExitCode::from(2);
    };
    let key_path = env_override(KEY_ENV, cli.key.as_ref().map(|k| k.display().to_string()))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_KEY));

    let config = match Config::load(&cli.opts.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    info!(host = %host, "display host");

    let shutdown = ShutdownToken::new();
    let options = SupervisorOptions {
        viewer: config.remote.viewer.clone(),
        one_shot: cli.once,
        small_mode: cli.small,
        test_mode: cli.test,
        ..SupervisorOptions::new(host, key_path)
    };
    let dispatcher = Dispatcher::from_config(&config, &cli.opts.config, cli.small, cli.test);
    let scheduler = RefreshScheduler::new(config.scheduler());

    let mut supervisor = Supervisor::new(
        config.ssh_connector(),
        dispatcher,
        scheduler,
        options,
        shutdown.clone(),
    )
    .with_notifier(Box::new(CommandNotifier::new(config.notify.command.clone())))
    .with_metrics(metrics_sink(&config));

    if let Err(e) = process::become_subreaper() {
        warn!(error = %e, "orphaned render processes will not be reaped");
    }
    if let Err(e) = install_signal_handlers(shutdown, supervisor.snapshot()) {
        warn!(error = %e, "signal handlers not installed");
    }

    let result = supervisor.run();
    supervisor.finish();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => ExitCode::from(e.exit_code()),
    }
}
