use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::Client;

use crate::error::{Error, Result};

pub const USER_AGENT: &str = concat!("booru-index/", env!("CARGO_PKG_VERSION"));

/// HTTP 响应，非 2xx 状态码在这一层不视为错误
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait HttpFetch: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Response>;
}

/// 下载图片，网络错误与非 2xx 状态码均视为下载失败
pub async fn download(http: &dyn HttpFetch, url: &str) -> Result<Vec<u8>> {
    let resp = http.fetch(url).await?;
    if !resp.is_success() {
        return Err(Error::DownloadFailure {
            url: url.to_string(),
            reason: format!("HTTP {}", resp.status),
        });
    }
    Ok(resp.body)
}

#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().user_agent(USER_AGENT).timeout(timeout).gzip(true).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<Response> {
        debug!("GET {url}");
        let failure = |e: reqwest::Error| Error::DownloadFailure { url: url.to_string(), reason: e.to_string() };
        let resp = self.client.get(url).send().await.map_err(failure)?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(failure)?;
        Ok(Response { status, body: body.to_vec() })
    }
}
