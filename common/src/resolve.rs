//! Host name lookups under a deadline.
//!
//! The system resolver blocks for as long as it likes, so names are looked
//! up on a helper thread and abandoned once the timeout passes. A late
//! answer is simply dropped with the channel.

use std::{
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    sync::mpsc,
    thread,
    time::Duration,
};

use log::{debug, warn};

use crate::error::LinkError;

const RESOLVER_STACK_SIZE: usize = 8 * 1024;

/// Resolves `host` to its first address. IP literals never leave the caller.
pub fn lookup(host: &str, port: u16, timeout: Duration) -> Result<SocketAddr, LinkError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let (tx, rx) = mpsc::channel();
    let name = host.to_string();
    thread::Builder::new()
        .name("dns".into())
        .stack_size(RESOLVER_STACK_SIZE)
        .spawn(move || {
            let result = (name.as_str(), port)
                .to_socket_addrs()
                .map(|mut addrs| addrs.next());
            let _ = tx.send(result);
        })?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(Some(addr))) => {
            debug!("resolved {host} to {addr}");
            Ok(addr)
        }
        Ok(Ok(None)) => Err(LinkError::protocol(format!("no address for {host}"))),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => {
            warn!("lookup of {host} timed out");
            Err(LinkError::Timeout(timeout.as_millis() as u32))
        }
    }
}

/// A looked-up address kept until the caller reports it stale.
#[derive(Debug, Clone)]
pub struct CachedAddr {
    host: String,
    port: u16,
    timeout: Duration,
    addr: Option<SocketAddr>,
}

impl CachedAddr {
    pub fn new(host: impl Into<String>, port: u16, timeout_ms: u32) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: Duration::from_millis(u64::from(timeout_ms)),
            addr: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn get(&mut self) -> Result<SocketAddr, LinkError> {
        if let Some(addr) = self.addr {
            return Ok(addr);
        }
        let addr = lookup(&self.host, self.port, self.timeout)?;
        self.addr = Some(addr);
        Ok(addr)
    }

    /// Forgets the address so the next connection looks it up again.
    pub fn invalidate(&mut self) {
        self.addr = None;
    }
}
