/**
 * MIT License
 *
 * Copyright (c) 2025 Takatoshi Kondo
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all
 * copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
 * SOFTWARE.
 */
use clap::Parser;
use mqttsn_gateway::config::GatewayConfig;
use mqttsn_gateway::gateway::Gateway;
use mqttsn_gateway::persistence::{FileBackend, MemoryBackend, StorageBackend};
use mqttsn_gateway::session_store::SessionStore;
use mqttsn_gateway::tracing_setup::init_tracing;
use mqttsn_gateway::transport::{UdpOptions, UdpTransport};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "mqttsn-gateway")]
#[command(about = "MQTT-SN gateway forwarding sensor traffic to an MQTT broker")]
struct Args {
    /// Path to the JSON5 configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    #[arg(value_parser = ["error", "warn", "info", "debug", "trace"])]
    log_level: String,

    /// UDP port for MQTT-SN clients
    #[arg(long, default_value_t = 10000)]
    udp_port: u16,

    /// Local IPv4 address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind_address: Ipv4Addr,

    /// Heartbeat period in milliseconds, overrides the configuration file
    #[arg(long)]
    heartbeat_ms: Option<u64>,

    /// Directory for persisted sessions. Sessions are kept in memory when omitted.
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// UDP socket send buffer size in bytes
    #[arg(long)]
    socket_send_buf_size: Option<usize>,

    /// UDP socket receive buffer size in bytes
    #[arg(long)]
    socket_recv_buf_size: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Parse log level
    let log_level = match args.log_level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" => tracing::Level::WARN,
        "info" => tracing::Level::INFO,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => unreachable!(), // clap validates this
    };

    // The engine is single threaded, one worker is enough
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(log_level, args))
}

async fn async_main(log_level: tracing::Level, args: Args) -> anyhow::Result<()> {
    let _guard = init_tracing(log_level)?;

    info!("Starting MQTT-SN gateway with log level: {log_level}");

    let mut config = match &args.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(heartbeat_ms) = args.heartbeat_ms {
        config.heartbeat_ms = heartbeat_ms;
    }
    config.validate()?;

    info!("Gateway configuration:");
    info!("  gateway id              {}", config.gateway_id);
    info!("  heartbeat               {} ms", config.heartbeat_ms);
    info!("  broker                  {}:{}", config.broker.address, config.broker.port);
    info!(
        "  --socket-send-buf-size  {}",
        args.socket_send_buf_size
            .map_or("None".to_string(), |v| v.to_string())
    );
    info!(
        "  --socket-recv-buf-size  {}",
        args.socket_recv_buf_size
            .map_or("None".to_string(), |v| v.to_string())
    );

    let backend: Box<dyn StorageBackend> = match &args.storage_dir {
        Some(dir) => {
            info!("Persisting sessions under {}", dir.display());
            Box::new(FileBackend::new(dir)?)
        }
        None => Box::new(MemoryBackend::new()),
    };
    let mut store = SessionStore::load(backend, config.store_limits())?;
    store.set_predefined_topics(
        config
            .predefined_topics
            .iter()
            .map(|t| (t.id, t.name.clone())),
    );

    let options = UdpOptions {
        send_buf_size: args.socket_send_buf_size,
        recv_buf_size: args.socket_recv_buf_size,
    };
    let transport = UdpTransport::bind(
        args.bind_address,
        args.udp_port,
        config.max_message_length,
        &options,
    )?;

    Gateway::new(&config, store, transport).run().await
}
