//! Listen port negotiation for the spawned wallet service

use crate::{Error, Result};
use std::net::TcpListener;
use tracing::debug;

/// Default first port probed for the service RPC listener.
pub const SERVICE_MIN_LISTEN_PORT: u16 = 10101;

/// Find an unused TCP port, probing upward from `start_port`.
///
/// The probe listener is dropped before returning, so the caller gets a
/// port that was free at probe time, not a held reservation.
pub fn get_unused_port(start_port: u16) -> Result<u16> {
    let mut port = start_port;
    loop {
        match TcpListener::bind(("127.0.0.1", port)) {
            Ok(listener) => {
                drop(listener);
                debug!("Port {} is available", port);
                return Ok(port);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                port = port.checked_add(1).ok_or_else(|| {
                    Error::PortAllocation(format!(
                        "no free port between {} and {}",
                        start_port,
                        u16::MAX
                    ))
                })?;
            }
            Err(e) => return Err(Error::PortAllocation(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skips_occupied_ports() {
        // Occupy K consecutive ports, expect start + K back.
        let base = get_unused_port(24121).unwrap();
        let _held: Vec<TcpListener> = (0..3)
            .map(|i| TcpListener::bind(("127.0.0.1", base + i)).unwrap())
            .collect();

        let port = get_unused_port(base).unwrap();
        assert_eq!(port, base + 3);
    }

    #[test]
    fn test_probe_listener_is_released() {
        let port = get_unused_port(24321).unwrap();
        // Binding the returned port must succeed: no leaked probe.
        let listener = TcpListener::bind(("127.0.0.1", port));
        assert!(listener.is_ok());
    }
}
