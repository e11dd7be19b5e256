//! Remote event log over a web form.
//!
//! Each log line is one `GET` to the form endpoint with the message
//! percent-encoded into a single query field; keep-alive pings are `HEAD`
//! requests on the same path. The HTTP client itself is platform code behind
//! [`HttpTransport`]; this module owns the URLs and the session state.

use log::debug;

use crate::{config::NetworkConfig, error::LinkError, network::TelemetryLink};

pub const USER_AGENT: &str = concat!("stairlight/", env!("CARGO_PKG_VERSION"));

/// RFC 3986 encoding: unreserved characters pass through, every other byte
/// of the UTF-8 text becomes `%XX`.
pub fn percent_encode(text: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(text.len() * 3);
    for &byte in text.as_bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(char::from(byte));
        } else {
            out.push('%');
            out.push(char::from(HEX[usize::from(byte >> 4)]));
            out.push(char::from(HEX[usize::from(byte & 0x0F)]));
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Get,
    Head,
}

/// A persistent HTTP client. Implementations bound every wait, drain the
/// response body so the connection can be reused, and report the status.
pub trait HttpTransport {
    /// Sets up the client for `target`, resolving its host under a deadline.
    fn connect(&mut self, target: &FormTarget) -> Result<(), LinkError>;

    fn request(&mut self, method: RequestMethod, url: &str) -> Result<u16, LinkError>;

    fn disconnect(&mut self);
}

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormTarget {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    path: String,
    field: String,
}

impl FormTarget {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        tls: bool,
        path: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
            path: path.into(),
            field: field.into(),
        }
    }

    pub fn from_config(network: &NetworkConfig) -> Self {
        Self::new(
            network.telemetry_host.clone(),
            network.telemetry_port,
            network.telemetry_tls,
            network.telemetry_path(),
            network.telemetry_field(),
        )
    }

    fn origin(&self) -> String {
        let (scheme, default_port) = if self.tls { ("https", 443) } else { ("http", 80) };
        if self.port == default_port {
            format!("{scheme}://{}", self.host)
        } else {
            format!("{scheme}://{}:{}", self.host, self.port)
        }
    }

    pub fn submit_url(&self, message: &str) -> String {
        format!(
            "{}{}?{}={}",
            self.origin(),
            self.path,
            self.field,
            percent_encode(message)
        )
    }

    pub fn keep_alive_url(&self) -> String {
        format!("{}{}", self.origin(), self.path)
    }
}

/// The persistent telemetry session.
pub struct FormSession<T: HttpTransport> {
    transport: T,
    target: FormTarget,
    open: bool,
}

impl<T: HttpTransport> FormSession<T> {
    pub fn new(transport: T, target: FormTarget) -> Self {
        Self {
            transport,
            target,
            open: false,
        }
    }

    fn round_trip(&mut self, method: RequestMethod, url: &str) -> Result<u16, LinkError> {
        if !self.open {
            return Err(LinkError::NotConnected);
        }
        self.transport.request(method, url).map_err(|err| {
            self.close();
            err
        })
    }
}

impl<T: HttpTransport> TelemetryLink for FormSession<T> {
    fn is_open(&self) -> bool {
        self.open
    }

    fn open(&mut self) -> Result<(), LinkError> {
        self.close();
        self.transport.connect(&self.target)?;
        debug!("telemetry session open to {}:{}", self.target.host, self.target.port);
        self.open = true;
        Ok(())
    }

    fn submit(&mut self, message: &str) -> Result<u16, LinkError> {
        let url = self.target.submit_url(message);
        self.round_trip(RequestMethod::Get, &url)
    }

    fn keep_alive(&mut self) -> Result<u16, LinkError> {
        let url = self.target.keep_alive_url();
        self.round_trip(RequestMethod::Head, &url)
    }

    fn close(&mut self) {
        if std::mem::take(&mut self.open) {
            self.transport.disconnect();
        }
    }
}
