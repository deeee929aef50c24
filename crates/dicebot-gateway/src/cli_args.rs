use std::path::PathBuf;

use clap::{Parser, Subcommand};

fn parse_account_password(value: &str) -> Result<(String, String), String> {
    let (account, password) = value
        .split_once('=')
        .ok_or_else(|| "expected ACCOUNT=PASSWORD".to_string())?;
    let account = account.trim();
    if account.is_empty() || !account.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(format!("account '{account}' must be numeric"));
    }
    Ok((account.to_string(), password.to_string()))
}

fn parse_device_protocol(value: &str) -> Result<String, String> {
    dicebot_endpoint::DeviceProtocol::parse(value)
        .map(|protocol| protocol.as_str().to_string())
        .ok_or_else(|| "expected one of: pad, android, watch".to_string())
}

#[derive(Debug, Parser)]
#[command(
    name = "dicebot-gateway",
    about = "Supervises chat-platform protocol endpoints for the dice bot",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long,
        env = "DICEBOT_CONFIG",
        help = "Optional TOML config file. Missing fields fall back to defaults."
    )]
    pub(crate) config: Option<PathBuf>,

    #[arg(
        long = "data-dir",
        env = "DICEBOT_DATA_DIR",
        help = "Directory holding endpoints.json and endpoint work dirs. Overrides data_dir from the config file."
    )]
    pub(crate) data_dir: Option<PathBuf>,

    #[arg(
        long = "log-level",
        help = "Tracing filter directives, for example 'info' or 'dicebot_endpoint=debug'. Overrides RUST_LOG."
    )]
    pub(crate) log_level: Option<String>,

    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub(crate) enum CliCommand {
    /// Start every enabled endpoint and keep them connected until Ctrl-C.
    Run {
        #[arg(
            long = "account-password",
            value_name = "ACCOUNT=PASSWORD",
            value_parser = parse_account_password,
            help = "Password for a managed account. Held in memory only; accounts without one log in by QR code."
        )]
        account_passwords: Vec<(String, String)>,
    },
    /// Administer the endpoint registry.
    Endpoints {
        #[command(subcommand)]
        command: EndpointsCommand,
    },
    /// Print a freshly generated device identity record.
    DeviceIdentity {
        #[arg(long, default_value = "pad", value_parser = parse_device_protocol)]
        protocol: String,
    },
}

#[derive(Debug, Subcommand)]
pub(crate) enum EndpointsCommand {
    /// List registered endpoints.
    List {
        #[arg(long, help = "Emit status reports as JSON.")]
        json: bool,
    },
    /// Register a process-backed endpoint for a platform account.
    AddManaged {
        #[arg(long)]
        account: String,
        #[arg(long, default_value = "")]
        name: String,
    },
    /// Register an endpoint that connects to an existing transport.
    AddTransport {
        #[arg(long, default_value = "QQ")]
        platform: String,
        #[arg(long = "connect-url")]
        connect_url: String,
        #[arg(long, default_value = "")]
        name: String,
    },
    /// Mark an endpoint enabled so `run` starts it.
    Enable { id: String },
    /// Mark an endpoint disabled.
    Disable { id: String },
    /// Forget an endpoint. Its work dir is left on disk.
    Remove { id: String },
    /// Delete the saved session token so the next launch logs in from scratch.
    Invalidate { id: String },
}
