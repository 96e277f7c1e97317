//! Socket factories per scheme and the socket level options applied to every connection.
use crate::config::SocketBufferSizeHints;
use crate::tls::TlsContext;
use std::collections::HashMap;

pub const HTTP_SCHEME: &str = "http";
pub const HTTPS_SCHEME: &str = "https";

/// Opens the connections of a scheme.
#[derive(Debug, Clone)]
pub enum SocketFactory {
    /// Plain TCP connections.
    Plain,
    /// TLS over TCP connections using the provided context.
    Tls(TlsContext),
}

impl SocketFactory {
    pub fn is_secure(&self) -> bool {
        matches!(self, SocketFactory::Tls(_))
    }
}

/// Maps scheme names to the [SocketFactory] opening connections for them.
#[derive(Debug, Clone, Default)]
pub struct SocketFactoryRegistry {
    factories: HashMap<String, SocketFactory>,
}

impl SocketFactoryRegistry {
    pub fn register<S: AsRef<str>>(mut self, scheme: S, factory: SocketFactory) -> Self {
        self.factories
            .insert(scheme.as_ref().to_ascii_lowercase(), factory);
        self
    }

    pub fn lookup(&self, scheme: &str) -> Option<&SocketFactory> {
        self.factories.get(&scheme.to_ascii_lowercase())
    }

    /// Returns the TLS context of the factory registered for `https`, if any.
    pub fn tls_context(&self) -> Option<&TlsContext> {
        match self.lookup(HTTPS_SCHEME) {
            Some(SocketFactory::Tls(context)) => Some(context),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SocketOptions {
    tcp_no_delay: bool,
    keep_alive: bool,
    send_buffer_size: Option<usize>,
    receive_buffer_size: Option<usize>,
}

impl SocketOptions {
    pub fn with_tcp_no_delay(self, tcp_no_delay: bool) -> Self {
        Self {
            tcp_no_delay,
            ..self
        }
    }

    pub fn with_keep_alive(self, keep_alive: bool) -> Self {
        Self { keep_alive, ..self }
    }

    /// When any of the hints is positive both buffers are sized to the larger of the two.
    pub fn with_buffer_size_hints(self, hints: SocketBufferSizeHints) -> Self {
        if hints.send == 0 && hints.receive == 0 {
            return self;
        }
        let size = hints.send.max(hints.receive);
        Self {
            send_buffer_size: Some(size),
            receive_buffer_size: Some(size),
            ..self
        }
    }

    pub fn tcp_no_delay(&self) -> bool {
        self.tcp_no_delay
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn send_buffer_size(&self) -> Option<usize> {
        self.send_buffer_size
    }

    pub fn receive_buffer_size(&self) -> Option<usize> {
        self.receive_buffer_size
    }
}
