use futures::StreamExt;
use log::{info, warn};
use tokio::task::spawn_blocking;

use super::WorkerContext;
use crate::db::{IndexedImage, QueuedImage};
use crate::error::{Error, Result};
use crate::imhash::{self, Fingerprint};
use crate::queue::Job;
use crate::scraper::{self, CrawlRequest, Crawler};
use crate::{http, metrics};

/// 一张待索引图片的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// 新图片，分配了新的 ID
    New(u64),
    /// 与已入库图片近似重复
    Duplicate(u64),
    /// 来源已经处理过
    Skipped,
}

impl ProcessOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::New(_) => "new",
            Self::Duplicate(_) => "duplicate",
            Self::Skipped => "skipped",
        }
    }
}

impl WorkerContext {
    pub async fn handle_job(&self, worker_id: u8, job: Job) -> Result<()> {
        match job {
            Job::ProcessQueuedImage(image) => {
                let outcome = self.process_queued_image(worker_id, &image).await?;
                metrics::inc_processed_image(outcome.label());
            }
            Job::CacheSavedImage { img_id } => {
                self.cache_saved_image(img_id).await?;
            }
            Job::DoIndexingCrawl { site, character } => {
                self.do_indexing_crawl(&site, &character).await?;
            }
            Job::DoAssociateCharacter { site, character, tags } => {
                let adapter = self.sites.get(&site)?;
                scraper::associate_tag(self.store.as_ref(), adapter.as_ref(), &character, &tags).await?;
            }
        }
        Ok(())
    }

    /// 下载并计算指纹
    async fn fetch_fingerprint(&self, image: &QueuedImage) -> Result<(Fingerprint, Vec<u8>)> {
        let data = match http::download(self.http.as_ref(), &image.source_url).await {
            Ok(data) => data,
            Err(e) => {
                metrics::inc_download_failure(&image.source_site);
                return Err(e);
            }
        };
        spawn_blocking(move || imhash::fingerprint_bytes(&data).map(|fp| (fp, data))).await?
    }

    /// 找到第一个能解析出图片 ID 的近似重复
    async fn find_duplicate(&self, fp: &Fingerprint) -> Result<Option<u64>> {
        let neighbors = self.index.search(fp.as_bytes(), self.config.threshold).await?;
        for neighbor in neighbors {
            match self.index.lookup(&neighbor.fingerprint).await? {
                Some(img_id) => return Ok(Some(img_id)),
                None => warn!("指纹 {} 没有对应的图片 ID", neighbor.fingerprint),
            }
        }
        Ok(None)
    }

    pub async fn process_queued_image(&self, worker_id: u8, image: &QueuedImage) -> Result<ProcessOutcome> {
        let alias = image.alias();
        if self.records.is_known_source(&image.source_site, &image.source_id).await? {
            info!("{alias} 已处理过，跳过");
            return Ok(ProcessOutcome::Skipped);
        }

        let (fp, data) = self.fetch_fingerprint(image).await?;

        if let Some(existing) = self.find_duplicate(&fp).await? {
            self.records.mark_duplicate(existing, image).await?;
            info!("{alias} ==> 重复 img_id:{existing}");
            return Ok(ProcessOutcome::Duplicate(existing));
        }

        let img_id = self.allocator.allocate(self.config.group_id, worker_id).await?;
        let record = IndexedImage::new(img_id, fp, image.clone());
        if !self.records.put(&record).await? {
            if self.records.is_known_source(&image.source_site, &image.source_id).await? {
                info!("{alias} 已被其他 worker 写入，丢弃 img_id:{img_id}");
                return Ok(ProcessOutcome::Skipped);
            }
            // 相同指纹已被其他来源抢先写入
            if let Some(existing) = self.find_duplicate(&fp).await? {
                self.records.mark_duplicate(existing, image).await?;
                info!("{alias} ==> 重复 img_id:{existing}，丢弃 img_id:{img_id}");
                return Ok(ProcessOutcome::Duplicate(existing));
            }
            warn!("{alias} 写入冲突，丢弃 img_id:{img_id}");
            return Ok(ProcessOutcome::Skipped);
        }
        info!("{alias} ==> img_id:{img_id}");

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.store(img_id, &image.source_url, &data).await {
                warn!("缓存 img_id:{img_id} 失败: {e}");
            }
        }
        Ok(ProcessOutcome::New(img_id))
    }

    /// 下载已入库图片并写入本地缓存
    pub async fn cache_saved_image(&self, img_id: u64) -> Result<bool> {
        let Some(cache) = &self.cache else {
            warn!("未配置缓存目录，忽略 img_id:{img_id}");
            return Ok(false);
        };
        let record = self.records.get(img_id).await?;
        if cache.contains(img_id, record.source_url()).await {
            return Ok(false);
        }
        let data = http::download(self.http.as_ref(), record.source_url()).await?;
        cache.store(img_id, record.source_url(), &data).await
    }

    /// 按角色关联的搜索标签爬取图站，将结果放入索引队列，返回入队数量
    pub async fn do_indexing_crawl(&self, site: &str, character: &str) -> Result<usize> {
        let adapter = self.sites.get(site)?;
        let Some(association) = scraper::association(self.store.as_ref(), site, character).await? else {
            warn!("{site}: 角色 {character} 没有关联的标签");
            return Ok(0);
        };
        let request = CrawlRequest {
            character: character.to_string(),
            terms: adapter.search_terms(&association)?,
            start_id: None,
        };

        let crawler = Crawler::new(adapter, self.http.clone(), self.config.crawl.clone());
        let mut posts = crawler.crawl(request);
        let mut count = 0;
        while let Some(item) = posts.next().await {
            match item {
                Ok(image) => {
                    let alias = image.alias();
                    self.queue.enqueue(&Job::ProcessQueuedImage(image)).await?;
                    info!("{site}: 已将 {alias} 加入索引队列");
                    count += 1;
                }
                Err(e @ Error::CrawlAborted { .. }) => {
                    warn!("{e}");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        info!("{site}: {character} 爬取结束，共 {count} 张图片");
        Ok(count)
    }
}
