//! HTTP transport.
//!
//! The client only ever issues GET requests with query parameters and reads the
//! body back as text, so that is all a [`Transport`] has to provide. Tests swap in
//! an in-memory DSM.

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::error::{Error, Result};

/// Something that can perform a DSM GET request.
pub trait Transport: Send + Sync {
    /// GET `url` with `query` and return the response body.
    ///
    /// A `timeout` of `None` means the transport's default. Exceeding the timeout
    /// must surface as [`Error::Timeout`].
    fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        timeout: Option<Duration>,
    ) -> Result<String>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        timeout: Option<Duration>,
    ) -> Result<String> {
        (**self).get(url, query, timeout)
    }
}

/// [`Transport`] backed by a blocking `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Create a transport with no default request timeout.
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("vmm-export/", env!("CARGO_PKG_VERSION")))
            .timeout(None)
            .build()?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        timeout: Option<Duration>,
    ) -> Result<String> {
        let mut request = self.client.get(url).query(query);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send()?;
        let status = response.status();
        trace!(url, %status, "DSM response");
        if !status.is_success() {
            return Err(Error::http(format!("{url} returned status {status}")));
        }
        Ok(response.text()?)
    }
}
