use std::time::Duration;

use anyhow::{Context, Result};

/// Build the shared HTTP client.
///
/// An explicit `proxy_url` routes every request through that proxy. Without
/// one, system proxy discovery stays off unless `CHATPAL_ENABLE_SYSTEM_PROXY`
/// is set, falling back to `no_proxy` if discovery fails.
pub fn build_http_client(
    timeout: Option<Duration>,
    proxy_url: Option<&str>,
) -> Result<reqwest::Client> {
    if let Some(proxy_url) = proxy_url.map(str::trim).filter(|url| !url.is_empty()) {
        let proxy = reqwest::Proxy::all(proxy_url)
            .with_context(|| format!("Invalid proxy URL '{}'", proxy_url))?;
        tracing::info!("Using HTTP proxy {}", proxy_url);
        return base_builder(timeout)
            .proxy(proxy)
            .build()
            .context("Failed to initialize proxied HTTP client");
    }

    let allow_system_proxy = std::env::var("CHATPAL_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if allow_system_proxy {
        match base_builder(timeout).build() {
            Ok(client) => return Ok(client),
            Err(e) => tracing::warn!(
                "HTTP client initialization with system proxy discovery failed ({}); retrying with no_proxy",
                e
            ),
        }
    }

    base_builder(timeout)
        .no_proxy()
        .build()
        .context("Failed to initialize HTTP client")
}

fn base_builder(timeout: Option<Duration>) -> reqwest::ClientBuilder {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_proxy_url() {
        assert!(build_http_client(None, Some("http://[invalid")).is_err());
    }

    #[test]
    fn blank_proxy_url_is_ignored() {
        assert!(build_http_client(Some(Duration::from_secs(5)), Some("  ")).is_ok());
    }
}
