//! Endpoint addresses.
//!
//! An address names a queue (or exchange) on a transport. Canonical text form:
//!
//! ```text
//! scheme://host[:port]/[virtual-host/]name
//! ```
//!
//! The scheme selects the transport (`inmemory`, `amqp`, ...). Addresses are
//! immutable and render back to the exact text they parse from.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Scheme of the built-in in-memory transport.
pub const IN_MEMORY_SCHEME: &str = "inmemory";
/// Scheme used for AMQP-style brokers.
pub const AMQP_SCHEME: &str = "amqp";

const IN_MEMORY_HOST: &str = "localhost";
const DEFAULT_AMQP_PORT: u16 = 5672;
const ERROR_QUEUE_SUFFIX: &str = "_error";
const SKIPPED_QUEUE_SUFFIX: &str = "_skipped";

static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<scheme>[A-Za-z][A-Za-z0-9+.\-]*)://(?P<host>[A-Za-z0-9.\-_]+)(?::(?P<port>[0-9]{1,5}))?(?P<path>/[^\s?#]*)$")
        .expect("address pattern is valid")
});

static SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._\-~]+$").expect("segment pattern is valid"));

/// Parsed address of a send or receive endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointAddress {
    scheme: String,
    host: String,
    port: Option<u16>,
    virtual_host: Option<String>,
    name: String,
}

impl EndpointAddress {
    /// Parses an address from its text form.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidEndpointAddress` if the text is not of the form
    /// `scheme://host[:port]/[vhost/]name`.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let trimmed = text.trim();
        let caps = ADDRESS_RE
            .captures(trimmed)
            .ok_or_else(|| Error::invalid_address(text, "expected scheme://host[:port]/[vhost/]name"))?;

        let port = match caps.name("port") {
            Some(m) => Some(
                m.as_str()
                    .parse::<u16>()
                    .map_err(|_| Error::invalid_address(text, "port out of range"))?,
            ),
            None => None,
        };

        let segments: Vec<&str> = caps["path"].split('/').filter(|s| !s.is_empty()).collect();
        let (virtual_host, name) = match segments.as_slice() {
            [name] => (None, *name),
            [vhost, name] => (Some((*vhost).to_string()), *name),
            [] => return Err(Error::invalid_address(text, "missing queue name")),
            _ => return Err(Error::invalid_address(text, "too many path segments")),
        };
        Self::check_segment(text, name)?;
        if let Some(vhost) = &virtual_host {
            Self::check_segment(text, vhost)?;
        }

        Ok(Self {
            scheme: caps["scheme"].to_ascii_lowercase(),
            host: caps["host"].to_string(),
            port,
            virtual_host,
            name: name.to_string(),
        })
    }

    /// Address of a queue on the in-memory transport.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidEndpointAddress` if `name` is not a valid queue name.
    pub fn in_memory(name: &str) -> Result<Self, Error> {
        Self::check_segment(name, name)?;
        Ok(Self {
            scheme: IN_MEMORY_SCHEME.to_string(),
            host: IN_MEMORY_HOST.to_string(),
            port: None,
            virtual_host: None,
            name: name.to_string(),
        })
    }

    /// Address of a queue on an AMQP-style broker.
    ///
    /// `port` defaults to 5672 and an empty or `/` virtual host is omitted.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidEndpointAddress` if the host, virtual host or
    /// name contain characters an address cannot carry.
    pub fn amqp(
        host: &str,
        port: Option<u16>,
        virtual_host: Option<&str>,
        name: &str,
    ) -> Result<Self, Error> {
        let vhost = virtual_host.filter(|v| !v.is_empty() && *v != "/");
        let text = match vhost {
            Some(v) => format!(
                "{AMQP_SCHEME}://{host}:{}/{v}/{name}",
                port.unwrap_or(DEFAULT_AMQP_PORT)
            ),
            None => format!(
                "{AMQP_SCHEME}://{host}:{}/{name}",
                port.unwrap_or(DEFAULT_AMQP_PORT)
            ),
        };
        Self::parse(&text)
    }

    fn check_segment(text: &str, segment: &str) -> Result<(), Error> {
        if SEGMENT_RE.is_match(segment) {
            Ok(())
        } else {
            Err(Error::invalid_address(
                text,
                format!("`{segment}` is not a valid queue or virtual host name"),
            ))
        }
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    #[must_use]
    pub fn virtual_host(&self) -> Option<&str> {
        self.virtual_host.as_deref()
    }

    /// Queue or exchange name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sibling address with a different queue name on the same host.
    #[must_use]
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Queue receiving faulted deliveries of this endpoint.
    #[must_use]
    pub fn error_queue(&self) -> Self {
        self.with_name(format!("{}{ERROR_QUEUE_SUFFIX}", self.name))
    }

    /// Queue receiving deliveries no consumer of this endpoint accepts.
    #[must_use]
    pub fn skipped_queue(&self) -> Self {
        self.with_name(format!("{}{SKIPPED_QUEUE_SUFFIX}", self.name))
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        if let Some(vhost) = &self.virtual_host {
            write!(f, "/{vhost}")?;
        }
        write!(f, "/{}", self.name)
    }
}

impl FromStr for EndpointAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EndpointAddress {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EndpointAddress> for String {
    fn from(value: EndpointAddress) -> Self {
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn in_memory_factory() {
        let addr = EndpointAddress::in_memory("q").unwrap();
        assert_eq!(addr.scheme(), "inmemory");
        assert_eq!(addr.name(), "q");
        assert_eq!(addr.host(), "localhost");
        assert_eq!(addr.to_string(), "inmemory://localhost/q");
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = EndpointAddress::parse("not a valid uri").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidEndpointAddress);

        assert!(EndpointAddress::parse("inmemory://localhost/").is_err());
        assert!(EndpointAddress::parse("inmemory://localhost/a/b/c").is_err());
        assert!(EndpointAddress::parse("amqp://host:99999/q").is_err());
    }

    #[test]
    fn parse_full_amqp_address() {
        let addr = EndpointAddress::parse("AMQP://broker.local:5673/tenant-a/orders").unwrap();
        assert_eq!(addr.scheme(), "amqp");
        assert_eq!(addr.host(), "broker.local");
        assert_eq!(addr.port(), Some(5673));
        assert_eq!(addr.virtual_host(), Some("tenant-a"));
        assert_eq!(addr.name(), "orders");
    }

    #[test]
    fn amqp_factory_defaults_port_and_root_vhost() {
        let addr = EndpointAddress::amqp("rabbit", None, Some("/"), "billing").unwrap();
        assert_eq!(addr.to_string(), "amqp://rabbit:5672/billing");
        assert_eq!(addr.virtual_host(), None);
    }

    #[test]
    fn derived_queues_share_host() {
        let addr = EndpointAddress::in_memory("orders").unwrap();
        assert_eq!(addr.error_queue().to_string(), "inmemory://localhost/orders_error");
        assert_eq!(addr.skipped_queue().name(), "orders_skipped");
    }

    #[test]
    fn serde_uses_text_form() {
        let addr = EndpointAddress::in_memory("q").unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"inmemory://localhost/q\"");
        let back: EndpointAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
        assert!(serde_json::from_str::<EndpointAddress>("\"nope\"").is_err());
    }

    proptest! {
        #[test]
        fn display_round_trips(
            host in "[a-z][a-z0-9\\-]{0,12}",
            port in proptest::option::of(1u16..),
            vhost in proptest::option::of("[a-z0-9_]{1,8}"),
            name in "[A-Za-z0-9._\\-]{1,16}",
        ) {
            let mut text = format!("amqp://{host}");
            if let Some(p) = port {
                text.push_str(&format!(":{p}"));
            }
            if let Some(v) = &vhost {
                text.push_str(&format!("/{v}"));
            }
            text.push_str(&format!("/{name}"));

            let addr = EndpointAddress::parse(&text).unwrap();
            prop_assert_eq!(addr.to_string(), text);
            prop_assert_eq!(EndpointAddress::parse(&addr.to_string()).unwrap(), addr);
        }
    }
}
