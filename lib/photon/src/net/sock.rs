use crate::net::support::NetworkResult;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use std::net::SocketAddr;

/// Binds a non-blocking TCP listener on `<ip>:<port>`.
pub fn bind_tcp(address: &str) -> NetworkResult<TcpListener> {
    Ok(TcpListener::bind(&address.parse::<SocketAddr>()?)?)
}

/// Binds a non-blocking UDP socket on `<ip>:<port>`.
pub fn bind_udp(address: &str) -> NetworkResult<UdpSocket> {
    Ok(UdpSocket::bind(&address.parse::<SocketAddr>()?)?)
}

/// Starts a non-blocking TCP connect to `<ip>:<port>`. The stream becomes
/// writable once (and if) the connection establishes.
pub fn connect_tcp(address: &str) -> NetworkResult<TcpStream> {
    Ok(TcpStream::connect(&address.parse::<SocketAddr>()?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::support::{ErrorType, NetworkError};

    #[test]
    fn test_bind_and_connect() {
        let listener = bind_tcp("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let _stream = connect_tcp(&addr.to_string()).unwrap();
    }

    #[test]
    fn test_bad_address_is_fatal() {
        match bind_tcp("not-an-address") {
            Err(NetworkError::Fatal(ErrorType::AddrParse)) => {}
            other => panic!("Unexpected bind result {:?}", other.err()),
        }
    }

    #[test]
    fn test_bind_udp() {
        let socket = bind_udp("127.0.0.1:0").unwrap();
        assert!(socket.local_addr().is_ok());
    }
}
