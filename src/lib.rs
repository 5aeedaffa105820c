//! EdgeProxy - A TLS-terminating reverse proxy
//!
//! Accepts all inbound web traffic for a set of domains, providing:
//! - Host/path routing to plaintext backends on localhost
//! - Per-connection SNI certificate selection from a certbot directory
//! - Unconditional http -> https upgrade
//! - Response header patching for proxy-unaware backends

pub mod certs;
pub mod headers;
pub mod proxy;
pub mod routes;

pub use certs::{CertError, CertStore, Credential};
pub use headers::{DecoratorChain, HttpsLocationFix, PoweredByStamp, ResponseDecorator};
pub use proxy::{ProxyConfig, ProxyServer};
pub use routes::{Outcome, RouteAction, RouteEntry, RouteTable};
