//! Transport to M-NET centralized controllers.
//!
//! - Blocking client using `ureq` (no async).
//! - Documents are POSTed as `text/xml` to the controller servlet of `device.host`.
//! - A process-wide proxy, when configured, applies to every call.

use log::debug;
use std::time::Duration;

use crate::protocol::{self, Node, XmlError};

const SERVLET_PATH: &str = "/servlet/MIMEReceiveServlet";

#[derive(Debug)]
pub enum TransportError {
    Transport(String),
    Http { status: u16, message: String },
    Malformed(String),
}

impl core::fmt::Display for TransportError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TransportError::Transport(s) => write!(f, "transport error: {}", s),
            TransportError::Http { status, message } => {
                let reason = http::StatusCode::from_u16(*status)
                    .ok()
                    .and_then(|s| s.canonical_reason())
                    .unwrap_or("unknown status");
                write!(f, "http {} {}: {}", status, reason, message)
            }
            TransportError::Malformed(s) => write!(f, "malformed response: {}", s),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<XmlError> for TransportError {
    fn from(value: XmlError) -> Self {
        TransportError::Malformed(value.0)
    }
}

impl From<ureq::Error> for TransportError {
    fn from(value: ureq::Error) -> Self {
        match value {
            ureq::Error::Transport(t) => TransportError::Transport(t.to_string()),
            ureq::Error::Status(status, res) => {
                let body = res.into_string().unwrap_or_else(|_| String::from("<no body>"));
                TransportError::Http { status, message: body }
            }
        }
    }
}

/// Sends one request document to a controller and returns its response document.
pub trait Transport: Send {
    fn exchange(&self, host: &str, request: &Node) -> Result<Node, TransportError>;
}

/// Process-wide proxy used for every outgoing HTTP call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl ProxySettings {
    /// `http://[user:[password]@]host:port`
    ///
    /// A user without a password still gets the colon; ureq only accepts `user:password` credentials.
    pub fn url(&self) -> String {
        let credentials = match (&self.user, &self.password) {
            (Some(u), p) => format!("{}:{}@", u, p.as_deref().unwrap_or_default()),
            (None, _) => String::new(),
        };
        format!("http://{}{}:{}", credentials, self.host, self.port)
    }
}

pub fn build_agent(proxy: Option<&ProxySettings>, timeout: Duration) -> Result<ureq::Agent, TransportError> {
    let mut builder = ureq::AgentBuilder::new().timeout(timeout);
    if let Some(p) = proxy {
        let proxy = ureq::Proxy::new(p.url()).map_err(|e| TransportError::Transport(format!("invalid proxy: {}", e)))?;
        builder = builder.proxy(proxy);
    }
    Ok(builder.build())
}

/// Controller endpoint for a configured host.
///
/// A bare host (`10.0.0.5`, `ctrl:8080`) gets the default scheme and servlet path;
/// anything carrying a scheme is used verbatim.
pub fn device_url(host: &str) -> Result<String, String> {
    let host = host.trim();
    if host.is_empty() {
        return Err("host is empty".to_string());
    }
    if host.contains("://") {
        return Ok(host.to_string());
    }
    if host.contains('/') {
        return Ok(format!("http://{}", host));
    }
    Ok(format!("http://{}{}", host, SERVLET_PATH))
}

pub struct HttpTransport {
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new(agent: ureq::Agent) -> Self {
        HttpTransport { agent }
    }
}

impl Transport for HttpTransport {
    fn exchange(&self, host: &str, request: &Node) -> Result<Node, TransportError> {
        let url = device_url(host).map_err(TransportError::Transport)?;
        let body = protocol::to_xml(request)?;
        debug!("POST {} ({} bytes)", url, body.len());

        let res = self
            .agent
            .post(&url)
            .set("Content-Type", "text/xml; charset=UTF-8")
            .set("Accept", "text/xml")
            .send_string(&body)?;
        let text = res
            .into_string()
            .map_err(|e| TransportError::Transport(e.to_string()))?;
        Ok(protocol::from_xml(&text)?)
    }
}
