//! Ephemeral port allocation.

use std::net::{Ipv4Addr, TcpListener};

use anyhow::Context;

/// Returns a port the OS currently considers free.
///
/// The listener is closed before returning, so another process may still grab the port;
/// the runtime start surfaces that as a start failure.
///
/// # Errors
/// Returns an error if no local socket can be bound.
pub fn allocate_port() -> anyhow::Result<u16> {
    let listener =
        TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).context("failed to bind an ephemeral port")?;
    let port = listener
        .local_addr()
        .context("failed to read ephemeral port")?
        .port();
    Ok(port)
}
