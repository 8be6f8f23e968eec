use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::{connect_with_timeout, ProxyError, DEFAULT_CONNECT_TIMEOUT_SECS};
use crate::relay;
use crate::rule::RedirectRule;
use crate::sniff::ClientHello;

/// User-Agent announced on CONNECT requests.
const TUNNEL_USER_AGENT: &str = "RedirectToProxy";

/// Service one redirected HTTPS connection.
///
/// The ClientHello is consumed just long enough to learn the SNI hostname,
/// then replayed into the CONNECT tunnel so the TLS handshake completes
/// between the client and the real origin.
pub async fn run(mut client: TcpStream, rule: &RedirectRule) -> Result<(), ProxyError> {
    let hello = ClientHello::read_from(&mut client).await?;
    tracing::debug!(
        server_name = %hello.server_name,
        proxy = rule.proxy_addr(),
        "servicing redirected HTTPS connection"
    );

    let mut proxy = connect_with_timeout(rule.proxy_addr(), DEFAULT_CONNECT_TIMEOUT_SECS).await?;
    establish_tunnel(&mut proxy, &hello.server_name, rule.protocol_port()).await?;

    proxy.write_all(&hello.to_record()).await?;

    relay::shuttle(client, proxy).await;
    Ok(())
}

/// Send the CONNECT request and consume the proxy's response head.
async fn establish_tunnel(
    proxy: &mut TcpStream,
    host: &str,
    port: u16,
) -> Result<(), ProxyError> {
    let request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         User-Agent: {TUNNEL_USER_AGENT}\r\n\
         Connection: keep-alive\r\n\r\n"
    );
    proxy.write_all(request.as_bytes()).await?;

    let mut reader = BufReader::new(&mut *proxy);
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    let status = parse_status_code(&status_line)?;
    if status != 200 {
        return Err(ProxyError::TunnelRefused(status));
    }

    // Drain headers until the blank line. The tunnel carries no payload
    // until we replay the ClientHello, so nothing can sit in the buffer.
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line.trim().is_empty() {
            break;
        }
    }
    Ok(())
}

fn parse_status_code(status_line: &str) -> Result<u16, ProxyError> {
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return Err(ProxyError::ProtocolError(
            "invalid HTTP status line".to_string(),
        ));
    }
    parts[1]
        .trim()
        .parse()
        .map_err(|_| ProxyError::ProtocolError("invalid status code".to_string()))
}
