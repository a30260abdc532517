//! mqttsn - MQTT-SN gateway and test client.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use giztoy_mqttsn::{Client, ClientConfig, Gateway, QoS, UdpTransport};
use tracing_subscriber::EnvFilter;

mod config;

use config::FileConfig;

/// MQTT-SN gateway bridging UDP sensor networks to an MQTT broker.
#[derive(Parser)]
#[command(name = "mqttsn")]
#[command(about = "MQTT-SN gateway and client")]
#[command(version)]
struct Cli {
    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Gateway(GatewayArgs),
    /// Publish one message through a gateway
    Pub(PubArgs),
    /// Print messages received through a gateway
    Sub(SubArgs),
}

#[derive(Args)]
struct GatewayArgs {
    /// Config file (YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// UDP listen address, overrides the config file
    #[arg(long)]
    listen: Option<String>,

    /// Broker address, overrides the config file
    #[arg(long)]
    broker: Option<String>,
}

#[derive(Args)]
struct ClientArgs {
    /// Gateway address
    #[arg(short, long, default_value = "127.0.0.1:1884")]
    gateway: String,

    /// Client id (default: mqttsn-<pid>)
    #[arg(long)]
    client_id: Option<String>,

    /// Topic name
    #[arg(short, long)]
    topic: String,

    /// QoS level: -1, 0, 1 or 2
    #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
    qos: i8,
}

impl ClientArgs {
    fn qos(&self) -> Result<QoS> {
        match self.qos {
            -1 => Ok(QoS::FireAndForget),
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => anyhow::bail!("invalid qos: {}", other),
        }
    }

    fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("mqttsn-{}", std::process::id()))
    }

    async fn connect(&self) -> Result<Client> {
        let transport = UdpTransport::connect(&self.gateway)
            .await
            .with_context(|| format!("failed to reach gateway {}", self.gateway))?;
        let client = Client::connect(transport, ClientConfig::new(self.client_id())).await?;
        Ok(client)
    }
}

#[derive(Args)]
struct PubArgs {
    #[command(flatten)]
    client: ClientArgs,

    /// Message payload
    #[arg(short, long)]
    message: String,

    /// Retain flag
    #[arg(long)]
    retain: bool,
}

#[derive(Args)]
struct SubArgs {
    #[command(flatten)]
    client: ClientArgs,

    /// Exit after this many messages (0 = run until interrupted)
    #[arg(short = 'n', long, default_value_t = 0)]
    count: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Gateway(args) => run_gateway(args).await,
        Commands::Pub(args) => run_pub(args).await,
        Commands::Sub(args) => run_sub(args).await,
    }
}

async fn run_gateway(args: GatewayArgs) -> Result<()> {
    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let config = file.into_gateway(args.listen, args.broker)?;
    tracing::info!("Bridging {} to broker {}", config.listen, config.broker);

    let gateway = Gateway::new(config);
    tokio::select! {
        result = gateway.serve() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            gateway.shutdown();
        }
    }
    Ok(())
}

async fn run_pub(args: PubArgs) -> Result<()> {
    let qos = args.client.qos()?;
    let client = args.client.connect().await?;
    client
        .publish(&args.client.topic, args.message.clone(), qos, args.retain)
        .await?;
    tracing::info!("Published {} bytes to {}", args.message.len(), args.client.topic);
    client.disconnect().await?;
    Ok(())
}

async fn run_sub(args: SubArgs) -> Result<()> {
    let qos = args.client.qos()?;
    let client = args.client.connect().await?;
    let granted = client.subscribe(&args.client.topic, qos).await?;
    tracing::info!("Subscribed to {} (granted {:?})", args.client.topic, granted);

    let mut received = 0;
    loop {
        tokio::select! {
            msg = client.recv_timeout(Duration::from_secs(1)) => {
                let Some(msg) = msg? else { continue };
                println!("{}: {}", msg.topic, String::from_utf8_lossy(&msg.payload));
                received += 1;
                if args.count > 0 && received >= args.count {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    client.disconnect().await?;
    Ok(())
}
