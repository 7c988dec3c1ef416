//! Shared HTTP request helpers for CLI commands.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub fn base_url(port: u16) -> String {
    format!("http://127.0.0.1:{}/api", port)
}

/// Decode a 2xx body, or surface the daemon's error text.
async fn read<T: for<'de> Deserialize<'de>>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        bail!("{}: {}", status, text);
    }
    resp.json::<T>().await.context("failed to parse response")
}

fn unreachable(url: &str) -> String {
    format!("failed to connect to tetherd at {}, is it running?", url)
}

pub async fn get_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    let resp = reqwest::get(url).await.with_context(|| unreachable(url))?;
    read(resp).await
}

/// GET with `q` carried as a query parameter.
pub async fn get_query<T: for<'de> Deserialize<'de>>(url: &str, q: &str) -> Result<T> {
    let url = reqwest::Url::parse_with_params(url, &[("q", q)]).context("invalid query")?;
    let resp = reqwest::get(url.clone())
        .await
        .with_context(|| unreachable(url.as_str()))?;
    read(resp).await
}

pub async fn post_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    let resp = reqwest::Client::new()
        .post(url)
        .send()
        .await
        .with_context(|| unreachable(url))?;
    read(resp).await
}

pub async fn post_json_body<T, R>(url: &str, body: &T) -> Result<R>
where
    T: Serialize,
    R: for<'de> Deserialize<'de>,
{
    let resp = reqwest::Client::new()
        .post(url)
        .json(body)
        .send()
        .await
        .with_context(|| unreachable(url))?;
    read(resp).await
}

pub async fn delete_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    let resp = reqwest::Client::new()
        .delete(url)
        .send()
        .await
        .with_context(|| unreachable(url))?;
    read(resp).await
}
