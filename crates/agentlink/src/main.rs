use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use agentlink::{
    ChannelConfig, ChannelError, ChannelManager, CommandMessage, Delivery, TransportKind,
};

#[derive(Debug, Parser)]
#[command(name = "agentlink", version, about = "Talk to a monitoring agent")]
struct Cli {
    /// Host the agent listens on.
    #[arg(long, env = "AGENTLINK_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, env = "AGENTLINK_CMD_PORT", default_value_t = 65501)]
    cmd_port: u16,

    #[arg(long, env = "AGENTLINK_EVT_PORT", default_value_t = 65502)]
    evt_port: u16,

    /// Use unix sockets in this directory instead of tcp.
    #[arg(long, env = "AGENTLINK_IPC_DIR")]
    ipc_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = DeliveryArg::AtLeastOnce)]
    delivery: DeliveryArg,

    /// Seconds to wait for each event before logging a timeout.
    #[arg(long, default_value_t = 120)]
    event_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DeliveryArg {
    AtLeastOnce,
    AtMostOnce,
}

impl From<DeliveryArg> for Delivery {
    fn from(arg: DeliveryArg) -> Self {
        match arg {
            DeliveryArg::AtLeastOnce => Delivery::AtLeastOnce,
            DeliveryArg::AtMostOnce => Delivery::AtMostOnce,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Send one command and print the reply.
    Send {
        name: String,
        /// Parameter as key=value; the value is parsed as JSON, else taken as a string.
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, serde_json::Value)>,
    },
    /// Print events as they arrive.
    Watch {
        /// Stop after this many events.
        #[arg(long)]
        count: Option<usize>,
    },
}

fn parse_param(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("AGENTLINK_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("agentlink={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let transport = match cli.ipc_dir {
        Some(dir) => TransportKind::Ipc { dir },
        None => TransportKind::Tcp,
    };
    let config = ChannelConfig::default()
        .with_transport(transport)
        .with_delivery(cli.delivery.into())
        .with_event_deadline(Duration::from_secs(cli.event_timeout));

    let manager = ChannelManager::new(config);
    let outcome = async {
        manager
            .init_channels(&cli.host, cli.cmd_port, cli.evt_port)
            .await
            .context("failed to connect to agent")?;

        match cli.command {
            Commands::Send { name, params } => send(&manager, name, params).await,
            Commands::Watch { count } => watch(&manager, count).await,
        }
    }
    .await;

    manager.shutdown_channels().await;
    outcome
}

async fn send(
    manager: &ChannelManager,
    name: String,
    params: Vec<(String, serde_json::Value)>,
) -> Result<()> {
    let message = params
        .into_iter()
        .fold(CommandMessage::new(name), |msg, (key, value)| {
            msg.with_value(key, value)
        });

    let response = manager
        .send_container_command(&message)
        .await
        .with_context(|| format!("command '{}' failed", message.name()))?;
    println!("{}", response.text());
    Ok(())
}

async fn watch(manager: &ChannelManager, count: Option<usize>) -> Result<()> {
    let mut seen = 0usize;
    while count.is_none_or(|limit| seen < limit) {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                return Ok(());
            }
            event = manager.get_container_event() => event,
        };

        match event {
            Ok(event) => {
                println!("{event}");
                seen += 1;
            }
            Err(ChannelError::EventTimeout { deadline }) => {
                tracing::info!(?deadline, "No event yet, still waiting");
            }
            Err(e) => return Err(e).context("event stream failed"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_values_parse_as_json_or_string() {
        assert_eq!(
            parse_param("interval=5").unwrap(),
            ("interval".to_string(), serde_json::json!(5))
        );
        assert_eq!(
            parse_param("pids=[1,2]").unwrap(),
            ("pids".to_string(), serde_json::json!([1, 2]))
        );
        assert_eq!(
            parse_param("mode=fast").unwrap(),
            ("mode".to_string(), serde_json::json!("fast"))
        );
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=1").is_err());
    }

    #[test]
    fn cli_reads_send_params() {
        let cli = Cli::try_parse_from([
            "agentlink",
            "--cmd-port",
            "7000",
            "send",
            "start_monitor",
            "--param",
            "interval=5",
        ])
        .unwrap();
        assert_eq!(cli.cmd_port, 7000);
        match cli.command {
            Commands::Send { name, params } => {
                assert_eq!(name, "start_monitor");
                assert_eq!(params.len(), 1);
            }
            Commands::Watch { .. } => panic!("expected send"),
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
