// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP session management.
//!
//! A [`Connector`] produces a [`Session`]: one long-lived keep-alive connection to
//! the endpoint's host. A session is reused for every poll until it reports a
//! transport error, after which the caller drops it and connects again. Nothing
//! in this module retries; the retry policy belongs to the poll loop.

use crate::config::PollerConfig;
use crate::errors::PollError;
use crate::tls;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Url};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

const TCP_KEEPALIVE: Duration = Duration::from_secs(60);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Absolute URL of the polled resource, validated once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, PollError> {
        let url = Url::parse(raw)
            .map_err(|e| PollError::Connection(format!("invalid url '{raw}': {e}")))?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(PollError::Connection(format!(
                    "unsupported scheme '{other}' in '{raw}'"
                )))
            }
        }
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| PollError::Connection(format!("no host in '{raw}'")))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| PollError::Connection(format!("no port for '{raw}'")))?;
        Ok(Self { url, host, port })
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.url.scheme() == "https"
    }

    /// `scheme://host[:port]` with default ports omitted.
    #[must_use]
    pub fn origin(&self) -> String {
        self.url.origin().ascii_serialization()
    }

    /// Request target sent on every poll: path plus query string.
    #[must_use]
    pub fn path_and_query(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Response header names and values in arrival order, with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeaders(Vec<(String, String)>);

impl ResponseHeaders {
    #[must_use]
    pub fn new(headers: Vec<(String, String)>) -> Self {
        Self(headers)
    }

    /// First value for `name`, compared case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl From<&HeaderMap> for ResponseHeaders {
    fn from(map: &HeaderMap) -> Self {
        Self(
            map.iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: ResponseHeaders,
    /// `None` when the server sent no bytes.
    pub body: Option<Vec<u8>>,
}

#[async_trait]
pub trait Session: Send {
    /// Issues one GET for `path` on the live connection.
    ///
    /// Any failure is a transport error; the session must not be used again after one.
    async fn send(
        &mut self,
        path: &str,
        headers: &[(String, String)],
    ) -> Result<Response, PollError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    type Session: Session;

    async fn connect(&self) -> Result<Self::Session, PollError>;

    /// The endpoint every session of this connector talks to.
    fn endpoint(&self) -> &Endpoint;
}

/// Transport settings for [`HttpConnector`].
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub proxy: Option<String>,
    pub basic_auth: Option<(String, String)>,
    pub headers: BTreeMap<String, String>,
}

impl SessionSettings {
    #[must_use]
    pub fn from_config(config: &PollerConfig) -> Self {
        Self {
            connect_timeout: Some(config.connect_timeout),
            request_timeout: Some(config.request_timeout),
            proxy: config.proxy.clone(),
            basic_auth: config.user.clone().zip(config.password.clone()),
            headers: config.headers.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpConnector {
    endpoint: Endpoint,
    settings: SessionSettings,
}

impl HttpConnector {
    #[must_use]
    pub fn new(endpoint: Endpoint, settings: SessionSettings) -> Self {
        Self { endpoint, settings }
    }

    pub fn from_config(config: &PollerConfig) -> Result<Self, PollError> {
        Ok(Self::new(
            Endpoint::parse(&config.url)?,
            SessionSettings::from_config(config),
        ))
    }

    fn build_client(&self) -> Result<Client, PollError> {
        let mut builder = tls::client_builder()?
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .tcp_keepalive(TCP_KEEPALIVE);
        if let Some(timeout) = self.settings.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(timeout) = self.settings.request_timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(proxy) = &self.settings.proxy {
            let proxy = reqwest::Proxy::https(proxy)
                .map_err(|e| PollError::Connection(format!("invalid proxy '{proxy}': {e}")))?;
            builder = builder.proxy(proxy);
        }
        builder
            .build()
            .map_err(|e| PollError::Connection(format!("failed to build http client: {e}")))
    }

    /// Opens and closes a TCP connection to the first reachable address.
    async fn dial(&self, addrs: &[SocketAddr]) -> Result<SocketAddr, PollError> {
        let mut last_error = format!("no address for {}", self.endpoint.host());
        for addr in addrs {
            let attempt = TcpStream::connect(addr);
            let connected = match self.settings.connect_timeout {
                Some(limit) => match tokio::time::timeout(limit, attempt).await {
                    Ok(connected) => connected,
                    Err(_) => {
                        last_error = format!("connecting to {addr} timed out");
                        continue;
                    }
                },
                None => attempt.await,
            };
            match connected {
                Ok(_stream) => return Ok(*addr),
                Err(e) => last_error = format!("cannot connect to {addr}: {e}"),
            }
        }
        Err(PollError::Connection(last_error))
    }

    fn static_headers(&self) -> Result<HeaderMap, PollError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.settings.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| PollError::Connection(format!("invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| PollError::Connection(format!("invalid header value: {e}")))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl Connector for HttpConnector {
    type Session = HttpSession;

    async fn connect(&self) -> Result<HttpSession, PollError> {
        // Fail fast on unresolvable hosts instead of on the first request
        let target = (self.endpoint.host(), self.endpoint.port());
        let resolve = lookup_host(target);
        let resolved = match self.settings.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, resolve).await.map_err(|_| {
                PollError::Connection(format!("resolving {} timed out", self.endpoint.host()))
            })?,
            None => resolve.await,
        };
        let addrs: Vec<SocketAddr> = resolved
            .map_err(|e| {
                PollError::Connection(format!("cannot resolve {}: {e}", self.endpoint.host()))
            })?
            .collect();
        let addr = match &self.settings.proxy {
            // The proxy is the peer, the endpoint may not be reachable from here
            Some(_) => addrs.first().copied().ok_or_else(|| {
                PollError::Connection(format!("no address for {}", self.endpoint.host()))
            })?,
            None => self.dial(&addrs).await?,
        };

        let session = HttpSession {
            client: self.build_client()?,
            origin: self.endpoint.origin(),
            headers: self.static_headers()?,
            basic_auth: self.settings.basic_auth.clone(),
        };
        debug!(
            endpoint = %self.endpoint,
            %addr,
            secure = self.endpoint.is_secure(),
            "HTTP session established"
        );
        Ok(session)
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// A reqwest client whose pool keeps a single idle keep-alive connection to the host.
#[derive(Debug)]
pub struct HttpSession {
    client: Client,
    origin: String,
    headers: HeaderMap,
    basic_auth: Option<(String, String)>,
}

#[async_trait]
impl Session for HttpSession {
    async fn send(
        &mut self,
        path: &str,
        headers: &[(String, String)],
    ) -> Result<Response, PollError> {
        let url = format!("{}{}", self.origin, path);
        let mut request = self.client.get(&url).headers(self.headers.clone());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some((user, password)) = &self.basic_auth {
            request = request.basic_auth(user, Some(password));
        }

        let response = request.send().await.map_err(send_error)?;
        let status = response.status().as_u16();
        let response_headers = ResponseHeaders::from(response.headers());
        let body = response.bytes().await.map_err(PollError::transport)?;

        Ok(Response {
            status,
            headers: response_headers,
            body: (!body.is_empty()).then(|| body.to_vec()),
        })
    }
}

/// Failures to open the connection, TLS handshake included, are connection errors.
fn send_error(err: reqwest::Error) -> PollError {
    if !err.is_connect() {
        return PollError::transport(err);
    }
    let mut rendered = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    PollError::Connection(rendered)
}
