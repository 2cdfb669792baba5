use log::warn;
use serde::Deserialize;
use url::Url;

use super::{CrawlRequest, Post, SiteAdapter, join_terms};
use crate::db::Rating;
use crate::error::{Error, Result};

pub const BASE_URL: &str = "https://gelbooru.com";

#[derive(Debug, Deserialize)]
struct GelbooruPost {
    id: u64,
    #[serde(default)]
    tags: String,
    file_url: Option<String>,
    rating: String,
}

impl GelbooruPost {
    fn into_post(self) -> Result<Post> {
        Ok(Post {
            id: self.id,
            url: self.file_url.filter(|u| !u.is_empty()),
            rating: Rating::from_booru(&self.rating)?,
            tags: self.tags.split_whitespace().map(String::from).collect(),
            authors: vec![],
        })
    }
}

/// 新版 API 将帖子包在 `post` 字段中，没有结果时该字段不存在
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GelbooruPage {
    List(Vec<serde_json::Value>),
    Envelope {
        #[serde(rename = "@attributes")]
        _attributes: serde_json::Value,
        #[serde(default)]
        post: Vec<serde_json::Value>,
    },
}

#[derive(Debug, Clone)]
pub struct Gelbooru {
    base_url: String,
}

impl Default for Gelbooru {
    fn default() -> Self {
        Self::new(BASE_URL)
    }
}

impl Gelbooru {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into() }
    }
}

impl SiteAdapter for Gelbooru {
    fn site(&self) -> &'static str {
        "gelbooru"
    }

    /// 关联值为逗号分隔的标签列表
    fn search_terms(&self, association: &str) -> Result<Vec<String>> {
        let terms = association
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect::<Vec<_>>();
        if terms.is_empty() {
            return Err(Error::InvalidTerms(format!("no tags in {association:?}")));
        }
        Ok(terms)
    }

    fn page_url(&self, request: &CrawlRequest, page: u32, limit: u32) -> Result<String> {
        let mut params = vec![
            ("page", "dapi".to_string()),
            ("s", "post".to_string()),
            ("q", "index".to_string()),
            ("json", "1".to_string()),
            ("pid", page.to_string()),
            ("limit", limit.to_string()),
        ];
        if !request.terms.is_empty() {
            params.push(("tags", join_terms(&request.terms)));
        }
        let url = Url::parse_with_params(&format!("{}/index.php", self.base_url), &params)
            .map_err(|e| Error::InvalidTerms(e.to_string()))?;
        Ok(url.into())
    }

    fn parse_page(&self, body: &[u8]) -> Option<Vec<Post>> {
        let items = match serde_json::from_slice::<GelbooruPage>(body).ok()? {
            GelbooruPage::List(items) => items,
            GelbooruPage::Envelope { post, .. } => post,
        };
        let posts = items
            .into_iter()
            .filter_map(|item| {
                let post = serde_json::from_value::<GelbooruPost>(item)
                    .map_err(Error::from)
                    .and_then(GelbooruPost::into_post);
                match post {
                    Ok(post) => Some(post),
                    Err(e) => {
                        warn!("gelbooru: 跳过无法解析的帖子: {e}");
                        None
                    }
                }
            })
            .collect();
        Some(posts)
    }
}
