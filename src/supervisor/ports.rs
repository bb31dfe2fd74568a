use std::net::TcpListener;

/// True when nothing is bound to `port` on the loopback interface.
pub fn port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Ask the OS for an ephemeral free port.
pub fn find_free_port() -> u16 {
    TcpListener::bind(("127.0.0.1", 0))
        .expect("failed to bind ephemeral port")
        .local_addr()
        .unwrap()
        .port()
}

/// Validate `desired`: returned unchanged when free, otherwise a suggested
/// free alternative. Consulted once at project registration and again at
/// every start; the caller decides whether a substitute is acceptable —
/// `start()` never rebinds silently.
pub fn allocate(desired: u16) -> u16 {
    if port_available(desired) {
        desired
    } else {
        find_free_port()
    }
}
