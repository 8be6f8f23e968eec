use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::{connect_with_timeout, ProxyError, DEFAULT_CONNECT_TIMEOUT_SECS};
use crate::relay;
use crate::rule::RedirectRule;

/// Upper bound on the buffered request head.
const MAX_HEAD_BYTES: usize = 32 * 1024;

/// Service one redirected HTTP connection.
///
/// The first request's head is reparsed into absolute-URI proxy form and
/// forwarded; everything after it is shuttled verbatim, so keep-alive and
/// pipelining behave as whatever the first request established.
pub async fn run(client: TcpStream, rule: &RedirectRule) -> Result<(), ProxyError> {
    tracing::debug!(proxy = rule.proxy_addr(), "servicing redirected HTTP connection");

    let mut proxy = connect_with_timeout(rule.proxy_addr(), DEFAULT_CONNECT_TIMEOUT_SECS).await?;

    let mut client = BufReader::new(client);
    let head = read_request_head(&mut client).await?;
    let proxied = to_proxy_form(&head)?;
    proxy.write_all(proxied.as_bytes()).await?;

    relay::shuttle(client, proxy).await;
    Ok(())
}

/// Read header lines up to and including the blank line. Body bytes stay in
/// the reader's buffer for the relay to pick up.
async fn read_request_head<R>(reader: &mut R) -> Result<String, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(ProxyError::ProtocolError(
                "connection closed before request head ended".to_string(),
            ));
        }
        head.push_str(&line);
        if head.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::ProtocolError("request head too large".to_string()));
        }
        if line == "\r\n" || line == "\n" {
            return Ok(head);
        }
    }
}

/// Rewrite the request line's target to absolute-URI form, taking the
/// authority from the Host header. Header lines pass through untouched.
fn to_proxy_form(head: &str) -> Result<String, ProxyError> {
    let (request_line, rest) = head
        .split_once("\r\n")
        .ok_or_else(|| ProxyError::ProtocolError("malformed request head".to_string()))?;

    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m, t, v),
        _ => {
            return Err(ProxyError::ProtocolError(format!(
                "malformed request line {request_line:?}"
            )))
        }
    };

    let host = rest
        .split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("host"))
        .map(|(_, value)| value.trim())
        .ok_or_else(|| ProxyError::ProtocolError("request carries no Host header".to_string()))?;

    let target = if target.starts_with("http://") || target.starts_with("https://") {
        target.to_string()
    } else {
        format!("http://{host}{target}")
    };

    Ok(format!("{method} {target} {version}\r\n{rest}"))
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::rule::Handler;

    #[test]
    fn test_origin_form_becomes_absolute() {
        let head = "GET /foo HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(
            to_proxy_form(head).unwrap(),
            "GET http://example.com/foo HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );
    }

    #[test]
    fn test_query_is_preserved() {
        let head = "GET /search?q=rust&page=2 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        assert_eq!(
            to_proxy_form(head).unwrap(),
            "GET http://example.com/search?q=rust&page=2 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n"
        );
    }

    #[test]
    fn test_absolute_target_is_left_alone() {
        let head = "GET http://example.com/foo HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(to_proxy_form(head).unwrap(), head);
    }

    #[test]
    fn test_missing_host_is_an_error() {
        let head = "GET /foo HTTP/1.1\r\nAccept: */*\r\n\r\n";
        assert!(matches!(
            to_proxy_form(head),
            Err(ProxyError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_malformed_request_line_is_an_error() {
        let head = "NONSENSE\r\nHost: example.com\r\n\r\n";
        assert!(matches!(
            to_proxy_form(head),
            Err(ProxyError::ProtocolError(_))
        ));
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connect, accept) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connect.unwrap(), accept.unwrap().0)
    }

    async fn read_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    #[tokio::test]
    async fn test_forwards_first_request_in_proxy_form() {
        let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_listener.local_addr().unwrap();
        let rule = RedirectRule::new(
            80,
            40080,
            Ipv4Addr::new(10, 0, 0, 5),
            proxy_addr.to_string(),
            Handler::Http,
            Vec::new(),
        )
        .unwrap();

        let (mut client, accepted) = socket_pair().await;
        let handler = tokio::spawn(async move { run(accepted, &rule).await });

        let (mut proxy_side, _) = proxy_listener.accept().await.unwrap();

        client
            .write_all(b"GET /foo HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let head = read_head(&mut proxy_side).await;
        assert_eq!(
            head,
            "GET http://example.com/foo HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );

        // Response bytes flow back to the client untouched.
        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";
        proxy_side.write_all(response).await.unwrap();

        let mut buf = vec![0u8; response.len()];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, response);

        drop(client);
        drop(proxy_side);
        handler.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_proxy_fails_the_connection() {
        // Reserve a port and close it again so the dial is refused.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = listener.local_addr().unwrap();
        drop(listener);

        let rule = RedirectRule::new(
            80,
            40080,
            Ipv4Addr::new(10, 0, 0, 5),
            dead_addr.to_string(),
            Handler::Http,
            Vec::new(),
        )
        .unwrap();

        let (_client, accepted) = socket_pair().await;
        let err = run(accepted, &rule).await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Io(_) | ProxyError::ConnectionTimeout(_)
        ));
    }
}
