//! 图站爬虫
//!
//! 每个图站实现 [`SiteAdapter`]，负责构造分页 URL 和解析返回的帖子，
//! 分页、重试、限速与过滤由 [`Crawler`] 统一完成。

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use log::{info, warn};
use regex::Regex;
use tokio::time::sleep;

use crate::db::{Op, QueuedImage, Rating, Store, keys};
use crate::error::{Error, Result};
use crate::http::HttpFetch;
use crate::metrics;

mod danbooru;
mod gelbooru;

pub use danbooru::Danbooru;
pub use gelbooru::Gelbooru;

/// 含有这些标签的帖子不会入队
pub const EXCLUDE_TAGS: [&str; 5] = ["loli", "shota", "bestiality", "guro", "shadman"];

static IMAGE_EXTENSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(png|jpe?g|gif)$").expect("invalid extension regex"));

/// 从 URL 路径中取出受支持的图片扩展名
pub fn image_extension(url: &str) -> Option<String> {
    let path = match url::Url::parse(url) {
        Ok(url) => url.path().to_string(),
        Err(_) => url.to_string(),
    };
    IMAGE_EXTENSION.captures(&path).map(|c| c[1].to_lowercase())
}

/// 从图站 API 解析出的帖子
#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    pub id: u64,
    pub url: Option<String>,
    pub rating: Rating,
    pub tags: Vec<String>,
    pub authors: Vec<String>,
}

impl Post {
    fn is_excluded(&self) -> bool {
        self.tags.iter().any(|t| EXCLUDE_TAGS.contains(&t.as_str()))
    }

    fn into_queued(self, site: &str, character: &str) -> Option<QueuedImage> {
        let url = self.url?;
        image_extension(&url)?;
        Some(QueuedImage {
            source_site: site.to_string(),
            source_id: self.id.to_string(),
            source_url: url,
            characters: BTreeSet::from([character.to_string()]),
            sfw_rating: self.rating,
            authors: self.authors.into_iter().collect(),
            source_tags: self.tags.into_iter().collect(),
        })
    }
}

/// 一次爬取请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlRequest {
    /// 归一化后的角色名，写入每张图片的 characters
    pub character: String,
    pub terms: Vec<String>,
    /// 只要 ID 小于它的帖子
    pub start_id: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// 两次翻页之间的间隔
    pub page_delay: Duration,
    pub max_pages: u32,
    /// 单页连续失败超过该次数后放弃本次爬取
    pub max_retries: u32,
    pub page_limit: u32,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self { page_delay: Duration::from_millis(500), max_pages: 1000, max_retries: 5, page_limit: 200 }
    }
}

pub trait SiteAdapter: Send + Sync {
    fn site(&self) -> &'static str;

    /// 将角色关联值解析为搜索标签
    fn search_terms(&self, association: &str) -> Result<Vec<String>>;

    /// 第 page 页（从 0 开始）的 API 地址
    fn page_url(&self, request: &CrawlRequest, page: u32, limit: u32) -> Result<String>;

    /// 解析一页结果，返回 None 表示响应格式不正确
    fn parse_page(&self, body: &[u8]) -> Option<Vec<Post>>;
}

/// 将搜索标签规范化并以空格连接
pub(crate) fn join_terms<'a>(terms: impl IntoIterator<Item = &'a String>) -> String {
    terms.into_iter().map(|t| t.trim().to_lowercase()).collect::<Vec<_>>().join(" ")
}

/// 按图站名称选择适配器
#[derive(Clone, Default)]
pub struct SiteRegistry {
    sites: HashMap<&'static str, Arc<dyn SiteAdapter>>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, adapter: Arc<dyn SiteAdapter>) -> Self {
        self.sites.insert(adapter.site(), adapter);
        self
    }

    pub fn get(&self, site: &str) -> Result<Arc<dyn SiteAdapter>> {
        self.sites.get(site).cloned().ok_or_else(|| Error::UnknownSite(site.to_string()))
    }

    pub fn sites(&self) -> Vec<&'static str> {
        let mut sites = self.sites.keys().copied().collect::<Vec<_>>();
        sites.sort();
        sites
    }

    /// 内置的所有图站
    pub fn builtin() -> Self {
        Self::new().register(Arc::new(Danbooru::default())).register(Arc::new(Gelbooru::default()))
    }
}

/// 记录角色在某个图站上的搜索标签
pub async fn associate_tag(
    store: &dyn Store,
    adapter: &dyn SiteAdapter,
    character: &str,
    tags: &str,
) -> Result<()> {
    adapter.search_terms(tags)?;
    let site = adapter.site();
    store
        .exec(vec![
            Op::sadd(keys::site_characters(site), [character]),
            Op::set(keys::site_character(site, character), tags),
        ])
        .await?;
    info!("{site}: {character} => {tags}");
    Ok(())
}

/// 角色在某个图站上的搜索标签
pub async fn association(store: &dyn Store, site: &str, character: &str) -> Result<Option<String>> {
    let key = keys::site_character(site, character);
    match store.get(key.as_bytes()).await? {
        Some(value) => Ok(Some(String::from_utf8(value).map_err(|e| Error::Malformed(e.to_string()))?)),
        None => Ok(None),
    }
}

struct CrawlState {
    page: u32,
    tries: u32,
    done: bool,
}

/// 分页爬取一个图站
#[derive(Clone)]
pub struct Crawler {
    adapter: Arc<dyn SiteAdapter>,
    http: Arc<dyn HttpFetch>,
    config: CrawlConfig,
}

impl Crawler {
    pub fn new(adapter: Arc<dyn SiteAdapter>, http: Arc<dyn HttpFetch>, config: CrawlConfig) -> Self {
        Self { adapter, http, config }
    }

    /// 请求一页，失败原因以字符串返回用于日志
    async fn fetch_page(&self, request: &CrawlRequest, page: u32) -> std::result::Result<Vec<Post>, String> {
        let url = self.adapter.page_url(request, page, self.config.page_limit).map_err(|e| e.to_string())?;
        let resp = self.http.fetch(&url).await.map_err(|e| e.to_string())?;
        if !resp.is_success() {
            return Err(format!("HTTP {}", resp.status));
        }
        self.adapter
            .parse_page(&resp.body)
            .ok_or_else(|| format!("unexpected response: {}", String::from_utf8_lossy(&resp.body)))
    }

    /// 抓取下一页并转换为待索引图片，爬取结束时返回 None
    async fn next_page(&self, request: &CrawlRequest, state: &mut CrawlState) -> Option<Vec<Result<QueuedImage>>> {
        let site = self.adapter.site();
        loop {
            if state.done || state.page >= self.config.max_pages {
                return None;
            }
            if state.tries > self.config.max_retries {
                state.done = true;
                warn!("{site}: 第 {} 页失败次数过多，放弃", state.page);
                metrics::inc_crawl_abort(site);
                return Some(vec![Err(Error::CrawlAborted {
                    site: site.to_string(),
                    page: state.page,
                    reason: format!("gave up after {} tries", state.tries),
                })]);
            }

            sleep(self.config.page_delay).await;
            info!("[{site}] tags: {} - page {}", join_terms(&request.terms), state.page);

            let posts = match self.fetch_page(request, state.page).await {
                Ok(posts) => posts,
                Err(reason) => {
                    warn!("{site}: 获取第 {} 页失败: {reason}", state.page);
                    state.tries += 1;
                    continue;
                }
            };
            if posts.is_empty() {
                state.done = true;
                return None;
            }

            state.page += 1;
            state.tries = 0;
            metrics::inc_crawled_page(site);

            // 整页都比起点新时跳过
            if let (Some(start_id), Some(min_id)) = (request.start_id, posts.iter().map(|p| p.id).min()) {
                if min_id > start_id {
                    continue;
                }
            }

            let images = posts
                .into_iter()
                .filter(|p| !p.is_excluded())
                .filter_map(|p| p.into_queued(site, &request.character))
                .map(Ok)
                .collect::<Vec<_>>();
            return Some(images);
        }
    }

    /// 惰性爬取，最后一项可能是 `CrawlAborted`
    pub fn crawl(&self, request: CrawlRequest) -> BoxStream<'static, Result<QueuedImage>> {
        let crawler = self.clone();
        let state = CrawlState { page: 0, tries: 0, done: false };
        stream::unfold((crawler, request, state), |(crawler, request, mut state)| async move {
            let page = crawler.next_page(&request, &mut state).await?;
            Some((page, (crawler, request, state)))
        })
        .flat_map(stream::iter)
        .boxed()
    }
}
