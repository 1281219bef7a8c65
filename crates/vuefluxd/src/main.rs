//! vuefluxd - Emporia Vue to InfluxDB forwarder.
//!
//! Polls per-channel usage from the Emporia Vue cloud API every interval and
//! writes downsampled watts/amps points to an InfluxDB v2 bucket.

use std::fmt::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use vueflux_core::VERSION;
use vueflux_core::clock::SystemClock;
use vueflux_core::config::Config;
use vueflux_core::scheduler::{PollScheduler, StopSignal};
use vueflux_core::sink::InfluxSink;
use vueflux_core::source::{Authenticator, Credentials, Device, MeterSource, VueClient};

/// Emporia Vue to InfluxDB forwarder.
#[derive(Parser)]
#[command(name = "vuefluxd", about = "An InfluxDB data source for Emporia Vue", version)]
struct Args {
    /// Path to config file.
    #[arg(short, long, default_value = "config.json", env = "VUEFLUX_CONFIG")]
    config: PathBuf,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    /// Optional file to store the token used to authenticate with the Emporia Vue API.
    #[arg(long, value_name = "PATH")]
    token_file: Option<PathBuf>,

    /// Show the devices associated with the Emporia Vue account and exit.
    #[arg(long)]
    show_devices: bool,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber.
/// Default level is INFO; --debug enables DEBUG, -q limits output to errors.
fn init_logging(debug: bool, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else if debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["vuefluxd", "vueflux_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Formats the device listing printed by --show-devices.
fn describe_devices(devices: &[Device]) -> String {
    let mut out = String::from("Listing devices...\n\n");

    for device in devices {
        let _ = writeln!(
            out,
            "Device: {}",
            device.name.as_deref().unwrap_or("(unnamed)")
        );
        let _ = writeln!(out, "ID: {}", device.id);
        let _ = writeln!(out, "Channels:");
        for channel in &device.channels {
            let _ = write!(out, "Channel {}", channel.channel_num);
            if let Some(name) = &channel.name {
                let _ = write!(out, " ({})", name);
            }
            let _ = writeln!(out, " - Multiplier: {}", channel.multiplier);
        }
        out.push('\n');
    }

    out
}

fn credentials(config: &Config) -> Option<Credentials> {
    match (&config.vue.username, &config.vue.password) {
        (Some(username), Some(password)) => Some(Credentials {
            username: username.clone(),
            password: password.clone(),
        }),
        _ => None,
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    info!("vuefluxd {} starting", VERSION);

    let config = Config::load(&args.config)?;
    info!("Config loaded from {}", args.config.display());
    if !args.show_devices {
        config.validate()?;
    }

    let auth = Authenticator::new(credentials(&config), args.token_file.clone())?;
    let mut client = VueClient::connect(auth)?;

    if args.show_devices {
        print!("{}", describe_devices(&client.devices()?));
        return Ok(());
    }

    let influx = &config.influx;
    let sink = InfluxSink::connect(
        influx.require_url()?,
        influx.token.clone(),
        influx.org_id.clone(),
        influx.client_options.clone(),
    )?;
    info!(
        "Writing to {} (bucket {})",
        influx.require_url()?,
        influx.require_bucket()?
    );

    // Setup graceful shutdown
    let stop = StopSignal::new();
    let s = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        s.stop();
    }) {
        warn!("Failed to set signal handler: {}", e);
    }

    let mut scheduler = PollScheduler::new(config, client, sink, SystemClock::new())?;
    scheduler.run(&stop)?;

    info!("Shutdown complete");
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.debug, args.quiet);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
