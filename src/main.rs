mod manifold;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "manifold",
    version,
    about = "Manifold - WebSocket-multiplexed TCP/UDP tunneling gateway"
)]
struct Cli {
    /// TCP port the listener binds.
    #[arg(long, env = "PORT", default_value_t = manifold::config::DEFAULT_PORT)]
    port: u16,

    /// Exact request path required for WebSocket upgrades.
    #[arg(long, env = "WS_PATH", default_value = manifold::config::DEFAULT_WS_PATH)]
    ws_path: String,

    /// If non-empty, clients must offer this value as the websocket subprotocol.
    #[arg(long, env = "TOKEN", default_value = "", hide_env_values = true)]
    token: String,

    /// Comma-separated IPv4 CIDR allow-list; "::/0" also admits IPv6 peers.
    #[arg(long, env = "CIDRS", default_value = manifold::config::DEFAULT_CIDRS)]
    cidrs: String,

    /// Serve over TLS instead of plain TCP.
    #[arg(long, env = "USE_TLS")]
    use_tls: bool,

    /// PEM certificate chain (required with --use-tls).
    #[arg(long, env = "CERT_FILE", default_value = "")]
    cert_file: String,

    /// PEM private key (required with --use-tls).
    #[arg(long, env = "KEY_FILE", default_value = "")]
    key_file: String,

    /// Log level (trace|debug|info|warn|error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format (text|json).
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    log_format: String,

    /// Log output (stderr|stdout|<file path>).
    #[arg(long, env = "LOG_OUTPUT", default_value = "stderr")]
    log_output: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    manifold::run(manifold::config::RawConfig {
        port: cli.port,
        ws_path: cli.ws_path,
        token: cli.token,
        cidrs: cli.cidrs,
        use_tls: cli.use_tls,
        cert_file: cli.cert_file,
        key_file: cli.key_file,
        log_level: cli.log_level,
        log_format: cli.log_format,
        log_output: cli.log_output,
    })
    .await
}
