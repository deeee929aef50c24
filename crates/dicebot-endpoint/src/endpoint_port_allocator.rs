use std::net::{Ipv4Addr, TcpListener};

/// Asks the OS for a free localhost TCP port for the protocol client's
/// listener. The test socket is closed before returning, so the port is only
/// free at the time of the call.
pub fn allocate_local_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Returns `true` when `port` can currently be bound on localhost.
pub fn local_port_available(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Websocket address the session layer dials once the client listens on `port`.
pub fn local_connect_url(port: u16) -> String {
    format!("ws://localhost:{port}")
}
