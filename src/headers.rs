//! Outbound response header interception
//! Stamps the marker header and rewrites insecure redirects coming from
//! backends that do not know they sit behind a TLS-terminating proxy

use hyper::header::{HeaderMap, HeaderName, HeaderValue, LOCATION};

/// Marker header set on every response the proxy produces
pub const MARKER_HEADER: &str = "x-powered-by";
pub const MARKER_VALUE: &str = "Love";

/// A header-only transformation applied to a response before it is sent.
/// Decorators alter header content only, never status codes or body bytes.
pub trait ResponseDecorator: Send + Sync {
    fn decorate(&self, headers: &mut HeaderMap);
}

/// Sets the fixed marker header
pub struct PoweredByStamp;

impl ResponseDecorator for PoweredByStamp {
    fn decorate(&self, headers: &mut HeaderMap) {
        headers.insert(
            HeaderName::from_static(MARKER_HEADER),
            HeaderValue::from_static(MARKER_VALUE),
        );
    }
}

/// Rewrites a `location` header that starts with `http:` to `https:`,
/// leaving the remainder of the value untouched. Some backends (Java Spring
/// apps in particular) redirect to the insecure scheme when proxied.
pub struct HttpsLocationFix;

impl ResponseDecorator for HttpsLocationFix {
    fn decorate(&self, headers: &mut HeaderMap) {
        let rewritten = headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|text| text.strip_prefix("http:"))
            .map(|rest| format!("https:{}", rest));

        if let Some(secure) = rewritten {
            if let Ok(value) = HeaderValue::from_str(&secure) {
                headers.insert(LOCATION, value);
            }
        }
    }
}

/// The decorators composed over every secure-listener response
pub struct DecoratorChain {
    decorators: Vec<Box<dyn ResponseDecorator>>,
}

impl DecoratorChain {
    /// The standard chain: scheme correction, then marker stamping
    pub fn standard() -> Self {
        Self {
            decorators: vec![Box::new(HttpsLocationFix), Box::new(PoweredByStamp)],
        }
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        for decorator in &self.decorators {
            decorator.decorate(headers);
        }
    }
}
