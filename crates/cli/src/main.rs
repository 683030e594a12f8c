use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "fanout")]
#[command(about = "Fanout CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the broadcast gateway (HTTP + WebSocket on one port). Clients connect at /cb/websocket.
    Serve {
        /// Config file path (default: FANOUT_CONFIG_PATH or ~/.fanout/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP and WebSocket port (default from config or 15280)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Broadcast one event to every connected client through a running gateway.
    Emit {
        /// Event name (the envelope's eventName).
        event: String,

        /// JSON payload (the envelope's data). Defaults to {}.
        #[arg(long, short, value_name = "JSON")]
        data: Option<String>,

        /// Config file path (default: FANOUT_CONFIG_PATH or ~/.fanout/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Connect as a client and print every event received until the gateway disconnects.
    Listen {
        /// Config file path (default: FANOUT_CONFIG_PATH or ~/.fanout/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("fanout {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Serve { config, port }) => {
            if let Err(e) = run_serve(config, port).await {
                log::error!("serve failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Emit {
            event,
            data,
            config,
        }) => {
            if let Err(e) = run_emit(config, event, data).await {
                log::error!("emit failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Listen { config }) => {
            if let Err(e) = run_listen(config).await {
                log::error!("listen failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_serve(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, _) = fanout::config::load_config(config_path)?;
    if let Some(p) = port {
        config.server.port = p;
    }
    log::info!(
        "starting gateway on {}:{}",
        config.server.bind,
        config.server.port
    );
    fanout::gateway::run_server(config).await
}

/// Host to dial for a configured bind address; wildcard binds are reached via loopback.
fn connect_host(bind: &str) -> &str {
    match bind.trim() {
        "0.0.0.0" | "::" | "" => "127.0.0.1",
        b => b,
    }
}

async fn run_emit(
    config_path: Option<std::path::PathBuf>,
    event: String,
    data: Option<String>,
) -> anyhow::Result<()> {
    let (config, _) = fanout::config::load_config(config_path)?;
    let data: serde_json::Value = match data {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("--data is not valid JSON: {}", e))?,
        None => serde_json::json!({}),
    };
    let envelope = fanout::gateway::Envelope::new(event, data);
    let url = format!(
        "http://{}:{}/emit",
        connect_host(&config.server.bind),
        config.server.port
    );

    let mut req = reqwest::Client::new().post(&url).json(&envelope);
    if let Some(token) = fanout::config::resolve_emit_token(&config) {
        req = req.bearer_auth(token);
    }
    let resp = req.send().await?;
    if !resp.status().is_success() {
        anyhow::bail!("{} returned {}", url, resp.status());
    }
    let report: fanout::gateway::BroadcastReport = resp.json().await?;
    println!(
        "delivered {:?} to {}/{} client(s) ({} failed)",
        envelope.event_name, report.delivered, report.recipients, report.failed
    );
    Ok(())
}

async fn run_listen(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, _) = fanout::config::load_config(config_path)?;
    let ws_url = format!(
        "ws://{}:{}{}{}",
        connect_host(&config.server.bind),
        config.server.port,
        fanout::gateway::ROUTE_PREFIX,
        config.transport.path
    );

    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url).await?;
    log::info!("connected to {}", ws_url);

    while let Some(msg) = ws.next().await {
        let msg = msg?;
        match msg {
            Message::Text(text) => {
                match serde_json::from_str::<fanout::gateway::Envelope>(&text) {
                    Ok(envelope) => println!("{} {}", envelope.event_name, envelope.data),
                    Err(_) => println!("{}", text),
                }
            }
            Message::Close(frame) => {
                if let Some(frame) = frame {
                    log::info!("gateway closed the connection: {}", frame.reason);
                }
                break;
            }
            _ => {}
        }
    }

    Ok(())
}
