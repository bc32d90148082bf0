pub mod llm;
pub mod local;
pub mod openlist;
pub mod tmdb;

use anyhow::{Context, Result};
use reqwest::{Client, Proxy};
use std::sync::OnceLock;

use crate::config::ProxyConfig;

/// Global HTTP client for connection pooling across all modules.
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

/// Build the shared client with the configured proxies
///
/// Must run before the first [`http_client`] call to take effect.
pub fn init_http_client(proxy: &ProxyConfig) -> Result<()> {
    let mut builder = Client::builder().pool_max_idle_per_host(2);

    if !proxy.http.is_empty() {
        builder = builder.proxy(Proxy::http(&proxy.http).context("Invalid [proxy] http")?);
    }
    if !proxy.https.is_empty() {
        builder = builder.proxy(Proxy::https(&proxy.https).context("Invalid [proxy] https")?);
    }

    let client = builder.build().context("Failed to create HTTP client")?;
    HTTP_CLIENT
        .set(client)
        .map_err(|_| anyhow::anyhow!("HTTP client already initialized"))
}

/// Returns a reference to the shared HTTP client.
/// Lazily initialized without proxies if [`init_http_client`] was never called.
pub fn http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .pool_max_idle_per_host(2) // Limit idle connections for memory savings
            .build()
            .expect("Failed to create HTTP client")
    })
}
