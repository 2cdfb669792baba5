use std::path::{Path, PathBuf};

use log::debug;
use tokio::fs;

use crate::error::Result;
use crate::scraper::image_extension;

/// 已入库图片的本地缓存，文件名为 `<img_id>.<ext>`
#[derive(Debug, Clone)]
pub struct ImageCache {
    dir: PathBuf,
}

impl ImageCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 缓存路径，URL 不是受支持的图片格式时返回 None
    pub fn path_for(&self, img_id: u64, url: &str) -> Option<PathBuf> {
        let ext = image_extension(url)?;
        Some(self.dir.join(format!("{img_id}.{ext}")))
    }

    pub async fn contains(&self, img_id: u64, url: &str) -> bool {
        match self.path_for(img_id, url) {
            Some(path) => fs::try_exists(path).await.unwrap_or(false),
            None => false,
        }
    }

    /// 写入缓存，已存在时不覆盖，返回是否写入
    pub async fn store(&self, img_id: u64, url: &str, data: &[u8]) -> Result<bool> {
        let Some(path) = self.path_for(img_id, url) else {
            return Ok(false);
        };
        if fs::try_exists(&path).await? {
            debug!("缓存已存在: {}", path.display());
            return Ok(false);
        }
        fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;
        debug!("写入缓存: {}", path.display());
        Ok(true)
    }
}
