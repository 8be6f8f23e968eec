use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use ipnet::IpNet;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use shunt_core::rule::{Handler, RedirectRule};
use shunt_divert::Redirector;

#[derive(Parser, Debug)]
#[command(name = "shunt")]
#[command(about = "Transparently redirect HTTP/HTTPS traffic through an upstream proxy")]
#[command(version)]
struct Cli {
    /// Upstream proxy as host:port.
    #[arg(long, value_name = "HOST:PORT")]
    proxy: String,

    /// Local IP for the redirect listeners; defaults to the outbound IP.
    #[arg(long, value_name = "IP")]
    listen: Option<Ipv4Addr>,

    /// Port whose outgoing connections are treated as HTTP.
    #[arg(long = "httpPort", default_value_t = 80, value_parser = port_in_range)]
    http_port: u16,

    /// Local port receiving redirected HTTP connections.
    #[arg(long = "httpRedirectPort", default_value_t = 40080, value_parser = port_in_range)]
    http_redirect_port: u16,

    /// Port whose outgoing connections are treated as HTTPS.
    #[arg(long = "httpsPort", default_value_t = 443, value_parser = port_in_range)]
    https_port: u16,

    /// Local port receiving redirected HTTPS connections.
    #[arg(long = "httpsRedirectPort", default_value_t = 40443, value_parser = port_in_range)]
    https_redirect_port: u16,

    /// CIDR blocks exempt from redirection.
    #[arg(long, value_name = "CIDR[,CIDR...]", value_delimiter = ',')]
    exclude: Vec<IpNet>,

    /// Verbose output.
    #[arg(short = 'v')]
    verbose: bool,
}

fn port_in_range(s: &str) -> Result<u16, String> {
    let port: u32 = s
        .parse()
        .map_err(|_| format!("`{s}` is not a port number"))?;
    if (1..=65535).contains(&port) {
        Ok(port as u16)
    } else {
        Err(format!("port {port} is out of range 1..=65535"))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() {
                ExitCode::from(1)
            } else {
                // --help and --version land here.
                ExitCode::SUCCESS
            };
            let _ = e.print();
            return code;
        }
    };

    init_tracing(cli.verbose);

    let rules = match build_rules(&cli) {
        Ok(rules) => rules,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::from(1);
        }
    };

    let redirector = match Redirector::start(rules).await {
        Ok(redirector) => redirector,
        Err(e) => {
            tracing::error!(error = %e, "failed to start redirector");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to wait for shutdown signal");
    }
    tracing::info!("shutting down");
    redirector.shutdown().await;
    ExitCode::SUCCESS
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let mut filter = EnvFilter::from_default_env();
    for target in ["shunt_cli", "shunt_core", "shunt_divert"] {
        filter = filter.add_directive(
            format!("{target}={level}")
                .parse()
                .expect("static directive parses"),
        );
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    if verbose {
        tracing::debug!("verbose output enabled");
    }
}

fn build_rules(cli: &Cli) -> Result<Vec<RedirectRule>> {
    let listen = match cli.listen {
        Some(ip) => ip,
        None => outbound_ipv4().context("could not discover the outbound IP; pass --listen")?,
    };

    tracing::info!(
        listen = %listen,
        http_port = cli.http_port,
        http_redirect_port = cli.http_redirect_port,
        https_port = cli.https_port,
        https_redirect_port = cli.https_redirect_port,
        proxy = %cli.proxy,
        excluded = ?cli.exclude,
        "starting with settings"
    );

    let http = RedirectRule::new(
        cli.http_port,
        cli.http_redirect_port,
        listen,
        cli.proxy.as_str(),
        Handler::Http,
        cli.exclude.clone(),
    )
    .context("invalid HTTP redirect rule")?;

    let https = RedirectRule::new(
        cli.https_port,
        cli.https_redirect_port,
        listen,
        cli.proxy.as_str(),
        Handler::Https,
        cli.exclude.clone(),
    )
    .context("invalid HTTPS redirect rule")?;

    Ok(vec![http, https])
}

/// Discover the outbound IPv4 address by connecting a UDP socket toward a
/// public address and reading the chosen local address. No packet is sent.
fn outbound_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}
