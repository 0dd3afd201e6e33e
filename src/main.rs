use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use relay_client::StreamEnd;
use relay_core::config::RelayConfig;
use relay_llm::{AnthropicStreamSource, HttpRetriever};
use relay_server::{HttpRegistry, LocalRegistry, RelayService, ServerConfig, SessionOptions};
use relay_telemetry::{init_telemetry, TelemetryConfig};

const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "relay", about = "Stream model output to WebSocket clients")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway and relay.
    Serve {
        /// Overrides RELAY_PORT.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Send one prompt to a running relay and print the answer.
    Chat {
        #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
        url: String,
        /// Seconds to wait for each frame.
        #[arg(long, default_value_t = 120)]
        read_timeout: u64,
        prompt: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { port } => serve(port, cli.log_json).await,
        Command::Chat {
            url,
            read_timeout,
            prompt,
        } => chat(&url, Duration::from_secs(read_timeout), &prompt, cli.log_json).await,
    }
}

async fn serve(port: Option<u16>, log_json: bool) -> anyhow::Result<()> {
    let config = RelayConfig::from_env().context("invalid relay configuration")?;
    let telemetry = init_telemetry(TelemetryConfig {
        json: log_json || config.log_json,
        ..Default::default()
    });
    let metrics = telemetry.metrics();

    tracing::info!(
        region = %config.region,
        api_endpoint = %config.api_endpoint,
        model = %config.model.model,
        "Starting relay"
    );

    let source = AnthropicStreamSource::new(config.model.clone())
        .context("failed to build model client")?;
    let registry = HttpRegistry::new(&config.api_endpoint, PUSH_TIMEOUT)
        .context("failed to build management API client")?;

    let mut options = SessionOptions {
        error_frames: config.error_frames,
        ..Default::default()
    };
    let mut relay = RelayService::new(Arc::new(source), Arc::new(registry), metrics);
    if let Some(retrieval) = &config.retrieval {
        options.min_score = retrieval.min_score;
        options.max_results = retrieval.max_results;
        let retriever = HttpRetriever::new(retrieval).context("failed to build retrieval client")?;
        relay = relay.with_retriever(Arc::new(retriever));
        tracing::info!(url = %retrieval.url, "Retrieval enabled");
    }
    let relay = Arc::new(relay.with_options(options));

    let server_config = ServerConfig {
        port: port.unwrap_or(config.port),
        region: config.region.clone(),
        ..Default::default()
    };
    let connections = Arc::new(LocalRegistry::new(server_config.max_send_queue));
    let handle = relay_server::start(server_config, Arc::clone(&relay), connections)
        .await
        .context("failed to start server")?;

    tracing::info!(port = handle.port, "Relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!(active = relay.active_sessions(), "Shutting down");
    relay.shutdown().await;
    Ok(())
}

async fn chat(url: &str, read_timeout: Duration, prompt: &str, log_json: bool) -> anyhow::Result<()> {
    let _telemetry = init_telemetry(TelemetryConfig {
        json: log_json,
        log_level: tracing::Level::WARN,
        ..Default::default()
    });

    let mut driver = relay_client::connect(url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?
        .with_read_timeout(read_timeout);

    let mut stdout = std::io::stdout();
    let transcript = driver
        .run(prompt, |delta| {
            let _ = stdout.write_all(delta.as_bytes());
            let _ = stdout.flush();
        })
        .await?;
    println!();

    match transcript.end {
        StreamEnd::Marker | StreamEnd::Closed => Ok(()),
        StreamEnd::Error(message) => anyhow::bail!("relay error: {message}"),
        StreamEnd::TimedOut => anyhow::bail!("no response within {read_timeout:?}"),
    }
}
