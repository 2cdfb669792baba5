use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::imhash::Fingerprint;

/// 图片分级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Safe,
    Questionable,
    Explicit,
}

impl Rating {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Questionable => "questionable",
            Self::Explicit => "explicit",
        }
    }

    /// 解析图站 API 返回的分级缩写
    pub fn from_booru(s: &str) -> Result<Self> {
        match s {
            "s" | "safe" | "g" | "general" => Ok(Self::Safe),
            "q" | "questionable" | "sensitive" => Ok(Self::Questionable),
            "e" | "explicit" => Ok(Self::Explicit),
            _ => Err(Error::UnknownRating(s.to_string())),
        }
    }
}

impl FromStr for Rating {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "safe" => Ok(Self::Safe),
            "questionable" => Ok(Self::Questionable),
            "explicit" => Ok(Self::Explicit),
            _ => Err(Error::UnknownRating(s.to_string())),
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 爬虫发现的一张待索引图片
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedImage {
    pub source_site: String,
    pub source_id: String,
    pub source_url: String,
    pub characters: BTreeSet<String>,
    pub sfw_rating: Rating,
    pub authors: BTreeSet<String>,
    pub source_tags: BTreeSet<String>,
}

impl QueuedImage {
    /// 别名格式为 `site#source_id`
    pub fn alias(&self) -> String {
        format!("{}#{}", self.source_site, self.source_id)
    }
}

/// 已入库的图片
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedImage {
    pub img_id: u64,
    pub imhash: Fingerprint,
    #[serde(flatten)]
    pub queued: QueuedImage,
}

impl IndexedImage {
    pub fn new(img_id: u64, imhash: Fingerprint, queued: QueuedImage) -> Self {
        Self { img_id, imhash, queued }
    }

    pub fn source_site(&self) -> &str {
        &self.queued.source_site
    }

    pub fn source_id(&self) -> &str {
        &self.queued.source_id
    }

    pub fn source_url(&self) -> &str {
        &self.queued.source_url
    }

    pub fn characters(&self) -> &BTreeSet<String> {
        &self.queued.characters
    }

    pub fn authors(&self) -> &BTreeSet<String> {
        &self.queued.authors
    }

    pub fn source_tags(&self) -> &BTreeSet<String> {
        &self.queued.source_tags
    }

    pub fn sfw_rating(&self) -> Rating {
        self.queued.sfw_rating
    }
}

/// 从 `index:image:<id>` 哈希表中读取主字段
pub(crate) struct PrimaryFields {
    pub imhash: Fingerprint,
    pub source_site: String,
    pub source_id: String,
    pub source_url: String,
    pub sfw_rating: Rating,
}

impl PrimaryFields {
    pub fn to_fields(image: &IndexedImage) -> Vec<(String, Vec<u8>)> {
        vec![
            ("imhash".to_string(), image.imhash.as_bytes().to_vec()),
            ("source_site".to_string(), image.source_site().as_bytes().to_vec()),
            ("source_id".to_string(), image.source_id().as_bytes().to_vec()),
            ("source_url".to_string(), image.source_url().as_bytes().to_vec()),
            ("sfw_rating".to_string(), image.sfw_rating().as_str().as_bytes().to_vec()),
        ]
    }

    pub fn from_fields(mut fields: HashMap<String, Vec<u8>>) -> Result<Self> {
        let mut take = |name: &str| {
            fields.remove(name).ok_or_else(|| Error::Malformed(format!("missing field {name}")))
        };
        let imhash = Fingerprint::try_from(take("imhash")?.as_slice())?;
        let source_site = utf8(take("source_site")?)?;
        let source_id = utf8(take("source_id")?)?;
        let source_url = utf8(take("source_url")?)?;
        let sfw_rating = utf8(take("sfw_rating")?)?.parse()?;
        Ok(Self { imhash, source_site, source_id, source_url, sfw_rating })
    }
}

pub(crate) fn utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| Error::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued() -> QueuedImage {
        QueuedImage {
            source_site: "danbooru".to_string(),
            source_id: "1".to_string(),
            source_url: "https://example.com/a.png".to_string(),
            characters: ["miku".to_string()].into(),
            sfw_rating: Rating::Safe,
            authors: BTreeSet::new(),
            source_tags: BTreeSet::new(),
        }
    }

    #[test]
    fn test_rating_from_booru() {
        assert_eq!(Rating::from_booru("s").unwrap(), Rating::Safe);
        assert_eq!(Rating::from_booru("g").unwrap(), Rating::Safe);
        assert_eq!(Rating::from_booru("q").unwrap(), Rating::Questionable);
        assert_eq!(Rating::from_booru("explicit").unwrap(), Rating::Explicit);
        assert!(matches!(Rating::from_booru("x"), Err(Error::UnknownRating(_))));
    }

    #[test]
    fn test_alias() {
        assert_eq!(queued().alias(), "danbooru#1");
    }

    #[test]
    fn test_primary_fields_roundtrip() {
        let image = IndexedImage::new(42, Fingerprint::from([7; 16]), queued());
        let fields = PrimaryFields::to_fields(&image).into_iter().collect::<HashMap<_, _>>();
        let primary = PrimaryFields::from_fields(fields).unwrap();
        assert_eq!(primary.imhash, image.imhash);
        assert_eq!(primary.source_url, image.source_url());
        assert_eq!(primary.sfw_rating, Rating::Safe);
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let err = PrimaryFields::from_fields(HashMap::new()).err().unwrap();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn test_job_payload_shape() {
        let json = serde_json::to_value(queued()).unwrap();
        assert_eq!(json["sfw_rating"], "safe");
        assert_eq!(json["characters"][0], "miku");
    }
}
