use anyhow::{Context, Result};
use clap::Parser;
use jitprobe::cli::Cli;
use jitprobe::config::JitConfig;
use jitprobe::format;
use jitprobe::module::{Endpoint, JitModule};
use jitprobe::signal::{self, SignalToken};
use std::io::Write;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Print the endpoint table
fn print_endpoints() {
    for endpoint in Endpoint::ALL {
        println!("{:<12} {}", endpoint.name(), endpoint.description());
    }
}

/// Build the load-time configuration: file first, then flag overrides
fn load_config(args: &Cli) -> Result<JitConfig> {
    let mut config = match &args.config {
        Some(path) => JitConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => JitConfig::default(),
    };
    if let Some(delay) = args.delay {
        config = config.with_delay(delay);
    }
    if let Some(tdelay) = args.tdelay {
        config = config.with_tdelay(tdelay);
    }
    if let Some(hz) = args.hz {
        config = config.with_hz(hz);
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    if args.list {
        print_endpoints();
        return Ok(());
    }

    let Some(name) = args.endpoint.as_deref() else {
        anyhow::bail!("Must specify an endpoint. Usage: jitprobe ENDPOINT (see --list)");
    };
    let endpoint: Endpoint = name.parse()?;

    if args.count == 0 {
        anyhow::bail!("Invalid value for --count: 0 (must be >= 1)");
    }

    let config = load_config(&args)?;

    // Signals must be routed before the engine thread is spawned
    let interrupt = SignalToken::new();
    signal::forward_signals(interrupt.clone()).context("Failed to install signal handling")?;

    let module = JitModule::load(config).context("Invalid configuration")?;
    let mut stdout = std::io::stdout().lock();
    for _ in 0..args.count {
        let reading = module
            .read(endpoint, &interrupt)
            .with_context(|| format!("Read of {} failed, try again", endpoint))?;
        let text = format::render(&reading, args.format)?;
        stdout.write_all(text.as_bytes())?;
        stdout.flush()?;
    }

    Ok(())
}
