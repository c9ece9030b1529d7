//! Free port detection.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::TcpListener;
use tracing::debug;

use crate::error::ClusterError;

/// Ask the OS for a currently unused TCP port.
///
/// The probe listener is released before returning, so the port is only
/// guaranteed free at the time of the call.
pub async fn detect_free_port() -> Result<u16, ClusterError> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .await
        .map_err(ClusterError::PortDetection)?;
    let port = listener
        .local_addr()
        .map_err(ClusterError::PortDetection)?
        .port();
    debug!(port, "detected free port");
    Ok(port)
}

/// Detect the cluster port and, in sticky mode, the sticky worker port.
///
/// Detection is sequential; the first failure aborts.
pub async fn detect_ports(sticky: bool) -> Result<(u16, Option<u16>), ClusterError> {
    let cluster_port = detect_free_port().await?;
    let sticky_worker_port = if sticky {
        Some(detect_free_port().await?)
    } else {
        None
    };
    Ok((cluster_port, sticky_worker_port))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detects_a_bindable_port() {
        let port = detect_free_port().await.unwrap();
        assert_ne!(port, 0);
        assert!(std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok());
    }

    #[tokio::test]
    async fn sticky_mode_detects_two_ports() {
        assert!(detect_ports(false).await.unwrap().1.is_none());
        assert!(detect_ports(true).await.unwrap().1.is_some());
    }
}
