use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use log::debug;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};

/// Create a socket bound to `local_addr` that can rebind right after a
/// restart, while the previous listener's connections sit in TIME_WAIT.
pub fn create_reusable_socket(local_addr: SocketAddr) -> io::Result<TcpSocket> {
    let socket = match local_addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(local_addr)?;
    Ok(socket)
}

/// Bind a listener on `addr` ("host:port"); port 0 picks a free port.
pub async fn bind_listener(addr: &str) -> io::Result<TcpListener> {
    let local_addr = lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("cannot resolve {}", addr)))?;
    let listener = create_reusable_socket(local_addr)?.listen(1024)?;
    debug!("Listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Connect to the backup server, giving up after `timeout`.
pub async fn connect(server_addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    debug!("Connecting to {}", server_addr);
    let stream = tokio::time::timeout(timeout, TcpStream::connect(server_addr))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connecting to {} timed out", server_addr),
            )
        })??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_and_connect() {
        let listener = bind_listener("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.map(|(_, peer)| peer) });
        let stream = connect(&addr.to_string(), Duration::from_secs(2)).await.unwrap();

        let peer = accept.await.unwrap().unwrap();
        assert_eq!(peer, stream.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_bind_unresolvable_fails() {
        assert!(bind_listener("not an address").await.is_err());
    }
}
