use tokio::io::{AsyncRead, AsyncWrite};

/// Copy bytes in both directions until each side reaches EOF or fails.
///
/// The two directions are independent copies, so a half-close on one side
/// does not starve the other; the call returns once both have finished.
/// Dropping the halves afterwards closes both sockets.
pub async fn shuttle<C, P>(client: C, proxy: P)
where
    C: AsyncRead + AsyncWrite,
    P: AsyncRead + AsyncWrite,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut proxy_rd, mut proxy_wr) = tokio::io::split(proxy);

    let (upstream, downstream) = tokio::join!(
        tokio::io::copy(&mut client_rd, &mut proxy_wr),
        tokio::io::copy(&mut proxy_rd, &mut client_wr),
    );

    if let Err(e) = upstream {
        tracing::debug!(error = %e, "client to proxy copy ended with error");
    }
    if let Err(e) = downstream {
        tracing::debug!(error = %e, "proxy to client copy ended with error");
    }
}
