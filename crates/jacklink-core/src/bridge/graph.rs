//! Port graph queries and auto-connect
//!
//! Port names follow the `client:port` convention. Auto-connect pairs the
//! n-th output of another client with the bridge's n-th input, leaving the
//! hardware client (`system`) alone.

use std::collections::BTreeSet;

use crate::error::BridgeResult;
use crate::server::AudioServer;

use super::PortDirection;

/// Client that is never auto-connected
pub const SYSTEM_CLIENT: &str = "system";

/// Client part of a `client:port` name
pub fn client_of(port: &str) -> &str {
    port.split_once(':').map_or(port, |(client, _)| client)
}

/// Every client that owns at least one audio port, sorted
pub fn list_clients(server: &dyn AudioServer) -> BridgeResult<Vec<String>> {
    let clients: BTreeSet<String> = server
        .list_ports(None)?
        .iter()
        .map(|port| client_of(port).to_string())
        .collect();
    Ok(clients.into_iter().collect())
}

/// Ports of one client in server order
pub fn client_ports(
    server: &dyn AudioServer,
    client: &str,
    direction: PortDirection,
) -> BridgeResult<Vec<String>> {
    Ok(server
        .list_ports(Some(direction))?
        .into_iter()
        .filter(|port| client_of(port) == client)
        .collect())
}

/// Clients eligible for auto-connect
pub fn external_clients(server: &dyn AudioServer, own_client: &str) -> BridgeResult<Vec<String>> {
    Ok(list_clients(server)?
        .into_iter()
        .filter(|c| c != own_client && c != SYSTEM_CLIENT)
        .collect())
}

/// Connect `client`'s outputs to `inputs` pairwise
///
/// Returns how many new connections were made. Existing connections are
/// left as they are; individual failures are logged and skipped.
pub fn auto_connect_client(
    server: &dyn AudioServer,
    client: &str,
    inputs: &[String],
) -> BridgeResult<usize> {
    let outputs = client_ports(server, client, PortDirection::Output)?;
    let mut made = 0;
    for (source, destination) in outputs.iter().zip(inputs) {
        let existing = server.connections(source).unwrap_or_default();
        if existing.iter().any(|p| p == destination) {
            continue;
        }
        match server.connect_ports(source, destination) {
            Ok(()) => {
                log::info!("Auto-connected {} -> {}", source, destination);
                made += 1;
            }
            Err(e) => log::warn!("Auto-connect {} -> {} failed: {}", source, destination, e),
        }
    }
    Ok(made)
}
