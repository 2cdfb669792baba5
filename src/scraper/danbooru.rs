use log::warn;
use serde::Deserialize;
use url::Url;

use super::{CrawlRequest, Post, SiteAdapter, join_terms};
use crate::db::Rating;
use crate::error::{Error, Result};

pub const BASE_URL: &str = "https://danbooru.donmai.us";

/// Danbooru 一次最多搜索两个标签
const MAX_TERMS: usize = 2;

#[derive(Debug, Deserialize)]
struct DanbooruPost {
    id: u64,
    #[serde(default)]
    tag_string: String,
    #[serde(default)]
    tag_string_artist: String,
    rating: Option<String>,
    file_url: Option<String>,
    large_file_url: Option<String>,
    preview_file_url: Option<String>,
}

impl DanbooruPost {
    fn into_post(self) -> Result<Post> {
        let rating = self.rating.as_deref().unwrap_or_default();
        Ok(Post {
            id: self.id,
            url: self.file_url.or(self.large_file_url).or(self.preview_file_url),
            rating: Rating::from_booru(rating)?,
            tags: self.tag_string.split_whitespace().map(String::from).collect(),
            authors: self.tag_string_artist.split_whitespace().map(String::from).collect(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Danbooru {
    base_url: String,
}

impl Default for Danbooru {
    fn default() -> Self {
        Self::new(BASE_URL)
    }
}

impl Danbooru {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into() }
    }
}

impl SiteAdapter for Danbooru {
    fn site(&self) -> &'static str {
        "danbooru"
    }

    fn search_terms(&self, association: &str) -> Result<Vec<String>> {
        let terms = association.split_whitespace().map(String::from).collect::<Vec<_>>();
        if terms.is_empty() || terms.len() > MAX_TERMS {
            return Err(Error::InvalidTerms(format!(
                "danbooru accepts 1 to {MAX_TERMS} tags, got {association:?}"
            )));
        }
        Ok(terms)
    }

    fn page_url(&self, request: &CrawlRequest, page: u32, limit: u32) -> Result<String> {
        if request.terms.len() > MAX_TERMS {
            return Err(Error::InvalidTerms(format!("too many tags: {:?}", request.terms)));
        }
        let mut terms = request.terms.clone();
        if let Some(start_id) = request.start_id {
            terms.truncate(1);
            terms.push(format!("id:<{start_id}"));
        }

        // Danbooru 的页码从 1 开始
        let mut params = vec![("page", (page + 1).to_string()), ("limit", limit.to_string())];
        if !terms.is_empty() {
            params.push(("tags", join_terms(&terms)));
        }
        let url = Url::parse_with_params(&format!("{}/posts.json", self.base_url), &params)
            .map_err(|e| Error::InvalidTerms(e.to_string()))?;
        Ok(url.into())
    }

    fn parse_page(&self, body: &[u8]) -> Option<Vec<Post>> {
        let items: Vec<serde_json::Value> = serde_json::from_slice(body).ok()?;
        let posts = items
            .into_iter()
            .filter_map(|item| {
                let post = serde_json::from_value::<DanbooruPost>(item)
                    .map_err(Error::from)
                    .and_then(DanbooruPost::into_post);
                match post {
                    Ok(post) => Some(post),
                    Err(e) => {
                        warn!("danbooru: 跳过无法解析的帖子: {e}");
                        None
                    }
                }
            })
            .collect();
        Some(posts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(terms: &[&str], start_id: Option<u64>) -> CrawlRequest {
        CrawlRequest {
            character: "miku".to_string(),
            terms: terms.iter().map(|t| t.to_string()).collect(),
            start_id,
        }
    }

    #[test]
    fn test_page_url() {
        let danbooru = Danbooru::default();
        let url = danbooru.page_url(&request(&["Hatsune_Miku "], None), 0, 200).unwrap();
        assert_eq!(url, "https://danbooru.donmai.us/posts.json?page=1&limit=200&tags=hatsune_miku");
    }

    #[test]
    fn test_page_url_with_cursor_keeps_first_tag() {
        let danbooru = Danbooru::default();
        let url = danbooru.page_url(&request(&["a", "b"], Some(100)), 2, 200).unwrap();
        assert_eq!(url, "https://danbooru.donmai.us/posts.json?page=3&limit=200&tags=a+id%3A%3C100");
    }

    #[test]
    fn test_search_terms() {
        let danbooru = Danbooru::default();
        assert_eq!(danbooru.search_terms("hatsune_miku").unwrap(), vec!["hatsune_miku"]);
        assert!(matches!(danbooru.search_terms("a b c"), Err(Error::InvalidTerms(_))));
        assert!(matches!(danbooru.search_terms("  "), Err(Error::InvalidTerms(_))));
    }

    #[test]
    fn test_parse_page() {
        let body = br#"[
            {"id": 2, "tag_string": "miku vocal", "tag_string_artist": "art1", "rating": "s",
             "large_file_url": "https://cdn/b.jpg", "preview_file_url": "https://cdn/b_p.jpg"},
            {"id": 3, "tag_string": "miku", "tag_string_artist": "", "rating": "q",
             "file_url": "https://cdn/c.png", "large_file_url": "https://cdn/c_l.png"},
            {"id": 4, "tag_string": "miku", "rating": "z"},
            {"tag_string": "no id"}
        ]"#;
        let posts = Danbooru::default().parse_page(body).unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].url.as_deref(), Some("https://cdn/b.jpg"));
        assert_eq!(posts[0].authors, vec!["art1"]);
        assert_eq!(posts[1].url.as_deref(), Some("https://cdn/c.png"));
        assert_eq!(posts[1].rating, Rating::Questionable);
    }

    #[test]
    fn test_parse_unexpected_response() {
        assert!(Danbooru::default().parse_page(br#"{"success": false}"#).is_none());
    }
}
