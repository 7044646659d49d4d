use std::{fs::OpenOptions, sync::Arc, sync::Mutex, time::Duration};

use clap::Parser;
use n0_error::{Result, StdResultExt};
use tor_http_proxy::{
    AgentBuilder, AgentOpts, AgentScope, ChannelOpts, DEFAULT_SOCKS_HOSTNAME, DEFAULT_SOCKS_PORT,
    IsolationMode, ListenEndpoint, ProxyListener, SocksEndpoint, TlsWrapper, TorDialer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// HTTP proxy that sends all traffic through Tor.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Server endpoint to listen on, e.g. `tcp:8080:interface=127.0.0.1`.
    server_endpoint: ListenEndpoint,

    /// Host of the Tor SOCKS listener.
    #[arg(long, default_value = DEFAULT_SOCKS_HOSTNAME)]
    socks_hostname: String,

    /// Port of the Tor SOCKS listener.
    #[arg(long, default_value_t = DEFAULT_SOCKS_PORT)]
    socks_port: u16,

    /// Log destination: `-` for stdout, otherwise a file to append to.
    #[arg(long, default_value = "-")]
    log: String,

    /// Ask Tor for a new circuit for every outbound connection.
    #[arg(long)]
    new_circuit: bool,

    /// Circuit isolation mode: `monoCircuit` or `circuitPerAgent`.
    #[arg(long, default_value_t = IsolationMode::MonoCircuit)]
    isolation: IsolationMode,

    /// Build one outbound agent per client connection instead of sharing one.
    #[arg(long)]
    agent_per_connection: bool,

    /// Seconds to wait for an outbound connection through Tor.
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    let opts = AgentOpts {
        connect_timeout: Duration::from_secs(cli.connect_timeout),
        new_circuit: cli.new_circuit,
        socks: SocksEndpoint::new(cli.socks_hostname, cli.socks_port),
        ..Default::default()
    };
    let tls = TlsWrapper::with_webpki_roots().anyerr()?;
    let builder = AgentBuilder::new(TorDialer)
        .isolation(cli.isolation)
        .opts(opts)
        .tls(tls);
    let agents = if cli.agent_per_connection {
        AgentScope::PerConnection(builder)
    } else {
        AgentScope::Shared(Arc::new(builder.build()))
    };
    info!(
        isolation = %cli.isolation,
        new_circuit = cli.new_circuit,
        agent_per_connection = cli.agent_per_connection,
        "starting proxy"
    );

    let listener = ProxyListener::bind(cli.server_endpoint, agents, ChannelOpts::default()).await?;
    tokio::signal::ctrl_c().await.anyerr()?;
    info!("interrupted, shutting down");
    listener.shutdown().await;
    Ok(())
}

fn init_logging(destination: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if destination == "-" {
        builder.init();
    } else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(destination)
            .std_context("failed to open log file")?;
        builder.with_ansi(false).with_writer(Mutex::new(file)).init();
    }
    Ok(())
}
