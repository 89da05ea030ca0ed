use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use nsgate::app::logging::{self, LogOptions};
use nsgate::app::App;
use nsgate::config::Config;

/// User-mode network gateway for a sandboxed network namespace.
#[derive(Parser, Debug)]
#[command(name = "nsgate", version)]
struct Cli {
    /// YAML config file
    #[arg(long, value_name = "FILE")]
    config: Option<String>,

    /// Log at info level
    #[arg(long)]
    debug: bool,

    /// tracing filter directive (overrides --debug)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Also log to this file; a trailing '/' makes it a directory
    #[arg(long, value_name = "PATH")]
    debug_log: Option<String>,

    /// Network namespace to open the device in, e.g. /proc/<pid>/ns/net
    #[arg(long, value_name = "PATH")]
    netns: Option<String>,

    /// TUN interface name
    #[arg(long, value_name = "NAME")]
    interface: Option<String>,

    /// Override the interface MTU
    #[arg(long, value_name = "N")]
    mtu: Option<u32>,

    /// Local forward: host listener into the namespace
    #[arg(short = 'L', value_name = "SPEC")]
    local: Vec<String>,

    /// Remote forward: namespace bind endpoint to a host target
    #[arg(short = 'R', value_name = "SPEC")]
    remote: Vec<String>,

    /// Send SIGWINCH to the parent once started
    #[arg(long)]
    notify_parent: bool,

    /// Seconds to wait for in-flight flows on shutdown
    #[arg(long, value_name = "SECS")]
    shutdown_grace: Option<u64>,
}

impl Cli {
    /// Flags override scalar settings and extend the forward lists.
    fn apply(&self, config: &mut Config) {
        if let Some(ns) = &self.netns {
            config.stack.netns = Some(ns.clone());
        }
        if let Some(name) = &self.interface {
            config.stack.interface = name.clone();
        }
        if let Some(mtu) = self.mtu {
            config.stack.mtu = Some(mtu);
        }
        if let Some(grace) = self.shutdown_grace {
            config.shutdown_grace = Some(grace);
        }
        config.forwards.local.extend(self.local.iter().cloned());
        config.forwards.remote.extend(self.remote.iter().cloned());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => nsgate::config::load_config(path)?,
        None => Config::default(),
    };
    cli.apply(&mut config);

    let log_options = LogOptions {
        env: std::env::var("RUST_LOG").ok(),
        level: cli.log_level.clone(),
        debug: cli.debug,
        config_level: config.log.level.clone(),
        file: cli.debug_log.clone().or_else(|| config.log.file.clone()),
    };
    if let Some(path) = logging::init(&log_options)? {
        info!(path = %path.display(), "logging to file");
    }

    info!(config = cli.config.as_deref().unwrap_or("-"), "nsgate starting");

    let app = App::new(config)?.with_notify_parent(cli.notify_parent);
    if let Err(e) = app.run().await {
        error!(error = %e, "nsgate failed");
        return Err(e);
    }
    Ok(())
}
