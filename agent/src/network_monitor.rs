//! Address discovery for throughput rows

use anyhow::{Context, Result};
use std::net::IpAddr;
use std::str::FromStr;
use tokio::net::UdpSocket;
use tracing::debug;

/// Get public IP address from external service
pub async fn get_public_ip(client: &reqwest::Client, service_url: &str) -> Result<IpAddr> {
    debug!("Querying public IP from: {}", service_url);

    let response = client
        .get(service_url)
        .send()
        .await
        .context("Failed to query public IP service")?;

    if !response.status().is_success() {
        anyhow::bail!("Public IP service returned error: {}", response.status());
    }

    let ip_str = response
        .text()
        .await
        .context("Failed to read public IP response")?;

    let ip = IpAddr::from_str(ip_str.trim()).context("Failed to parse public IP address")?;

    debug!("Detected public IP: {}", ip);
    Ok(ip)
}

/// Local address the kernel would use for the default route.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub async fn detect_local_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("Failed to bind UDP socket")?;
    socket
        .connect("192.0.2.1:9")
        .await
        .context("No default route")?;
    let ip = socket.local_addr()?.ip();

    if ip.is_unspecified() {
        anyhow::bail!("Could not determine local address");
    }
    debug!("Detected local IP: {}", ip);
    Ok(ip)
}
