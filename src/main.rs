use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ibecho::prelude::*;

/// RDMA echo.
///
/// Without SERVERNAME, listen for one client and write the payload into its
/// buffer. With SERVERNAME, connect to that server and print what it wrote.
#[derive(Parser, Debug)]
#[command(name = "ibecho", version, about)]
struct Cli {
    /// Metadata TCP port.
    #[arg(short, long)]
    port: Option<u16>,

    /// TOML file with an `[ibecho]` table.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// RDMA device to open; the first one found by default.
    #[arg(short, long)]
    device: Option<String>,

    /// Bound, in milliseconds, on waiting for the write to complete (server)
    /// or to arrive (client).
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Server to connect to. Serve if absent.
    servername: Option<String>,
}

impl Cli {
    fn load_config(&self) -> Result<EchoConfig, EchoError> {
        let mut config = match &self.config {
            Some(path) => EchoConfig::load_toml(path)?,
            None => EchoConfig::default(),
        };
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(device) = &self.device {
            config.device = Some(device.clone());
        }
        if let Some(ms) = self.timeout_ms {
            config.completion_timeout_ms = ms;
            config.wait_timeout_ms = ms;
        }
        Ok(config)
    }
}

#[cfg(feature = "verbs")]
fn run(config: EchoConfig, role: &Role) -> Result<Outcome, EchoError> {
    Session::new(Ibverbs, config)?.run(role)
}

#[cfg(not(feature = "verbs"))]
fn run(config: EchoConfig, _role: &Role) -> Result<Outcome, EchoError> {
    config.validate()?;
    log::error!("built without the `verbs` feature, no RDMA device is reachable");
    Err(SetupError::NoDevice.into())
}

fn main() -> ExitCode {
    // Usage errors exit with 2 here, before anything is allocated.
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = cli
        .load_config()
        .and_then(|config| run(config, &Role::from_server_name(cli.servername.clone())));
    match result {
        Ok(outcome) => {
            if let Some(message) = outcome.message {
                println!("{}", message);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            let code = e.exit_code();
            eprintln!("ibecho: {:#}", anyhow::Error::from(e));
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}
