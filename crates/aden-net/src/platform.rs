//! TCP socket setup shared by the listener and accepted client sockets.
//!
//! [`SocketConfig`] gathers the options applied through `socket2`: address
//! reuse, dual-stack binding when the bind address is IPv6, the listen backlog,
//! and TCP_NODELAY plus keepalive on every accepted stream.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

/// Socket options for the listening socket and every accepted connection.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm on accepted sockets. Default: true.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive on accepted sockets. Default: true.
    pub keepalive_enabled: bool,
    /// Idle time before the first keepalive probe. Default: 60s.
    pub keepalive_idle: Duration,
    /// Interval between keepalive probes. Default: 10s.
    pub keepalive_interval: Duration,
    /// Probes sent before the peer is declared dead. Default: 3.
    pub keepalive_retries: u32,
    /// Enable `SO_REUSEADDR` on the listening socket. Default: true except on Windows.
    pub reuse_addr: bool,
    /// Pending-connection backlog passed to `listen`. Default: 1024.
    pub backlog: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
            keepalive_retries: 3,
            reuse_addr: !cfg!(target_os = "windows"),
            backlog: 1024,
        }
    }
}

/// Apply per-connection options to an accepted [`TcpStream`].
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if config.keepalive_enabled {
        let keepalive = TcpKeepalive::new()
            .with_time(config.keepalive_idle)
            .with_interval(config.keepalive_interval);

        // Retry counts are not configurable on macOS.
        #[cfg(any(target_os = "linux", target_os = "windows"))]
        let keepalive = keepalive.with_retries(config.keepalive_retries);

        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

/// Bind a listening socket on `addr`.
///
/// An IPv6 address binds dual-stack, accepting IPv4-mapped peers on the same
/// socket. Must be called from within a Tokio runtime.
pub fn bind_listener(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.backlog.min(i32::MAX as u32) as i32)?;

    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bound_listener_accepts_ipv4() {
        let config = SocketConfig::default();
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let client = TcpStream::connect(addr).await;
        assert!(client.is_ok(), "IPv4 connection should succeed");
    }

    #[tokio::test]
    async fn test_dual_stack_accepts_ipv4_peer() {
        let config = SocketConfig::default();
        let listener = match bind_listener("[::]:0".parse().unwrap(), &config) {
            Ok(listener) => listener,
            Err(_) => {
                eprintln!("IPv6 not available, skipping test");
                return;
            }
        };
        let port = listener.local_addr().unwrap().port();

        let client = TcpStream::connect(("127.0.0.1", port)).await;
        assert!(client.is_ok(), "dual-stack socket should accept IPv4 peers");
    }

    #[tokio::test]
    async fn test_accepted_stream_is_configured() {
        let config = SocketConfig::default();
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        configure_stream(&server_side, &config).unwrap();

        assert!(server_side.nodelay().unwrap(), "TCP_NODELAY should be enabled");
        assert!(
            SockRef::from(&server_side).keepalive().unwrap(),
            "Keepalive should be enabled"
        );
    }

    #[tokio::test]
    async fn test_options_can_be_disabled() {
        let config = SocketConfig {
            tcp_nodelay: false,
            keepalive_enabled: false,
            ..Default::default()
        };
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        configure_stream(&client, &config).unwrap();

        assert!(!client.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_rebinding_same_port_after_close() {
        let config = SocketConfig::default();
        let first = bind_listener("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        let addr = first.local_addr().unwrap();
        drop(first);

        if config.reuse_addr {
            assert!(bind_listener(addr, &config).is_ok());
        }
    }
}
