//! 至少一次投递的任务队列
//!
//! 取出的任务会带上租约期限，处理完成后 ack，失败时 nack 重新入队。
//! worker 崩溃或超时导致租约过期的任务由 `reclaim_expired` 放回队列。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::QueuedImage;
use crate::error::{Error, Result};

mod memory;
mod redis_queue;

pub use memory::MemoryJobQueue;
pub use redis_queue::RedisJobQueue;

/// 索引队列
pub const INDEX_QUEUE: &str = "backend-index";
/// 爬虫队列
pub const CRAWL_QUEUE: &str = "scraper";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    ProcessQueuedImage(QueuedImage),
    CacheSavedImage { img_id: u64 },
    DoIndexingCrawl { site: String, character: String },
    DoAssociateCharacter { site: String, character: String, tags: String },
}

impl Job {
    /// 任务所属的队列
    pub fn queue(&self) -> &'static str {
        match self {
            Self::ProcessQueuedImage(_) | Self::CacheSavedImage { .. } => INDEX_QUEUE,
            Self::DoIndexingCrawl { .. } | Self::DoAssociateCharacter { .. } => CRAWL_QUEUE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ProcessQueuedImage(_) => "process_queued_image",
            Self::CacheSavedImage { .. } => "cache_saved_image",
            Self::DoIndexingCrawl { .. } => "do_indexing_crawl",
            Self::DoAssociateCharacter { .. } => "do_associate_character",
        }
    }
}

/// 队列中保存的任务
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    id: u64,
    /// 已失败的投递次数
    #[serde(default)]
    attempts: u32,
    job: Job,
}

impl Envelope {
    fn encode(id: u64, job: &Job) -> Result<String> {
        #[derive(Serialize)]
        struct Borrowed<'a> {
            id: u64,
            attempts: u32,
            job: &'a Job,
        }
        Ok(serde_json::to_string(&Borrowed { id, attempts: 0, job })?)
    }
}

/// 一次投递，payload 为队列中的原始数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub queue: String,
    pub id: u64,
    pub attempts: u32,
    pub payload: String,
}

impl Delivery {
    fn new(queue: &str, payload: String) -> Result<Self> {
        #[derive(Deserialize)]
        struct Header {
            id: u64,
            #[serde(default)]
            attempts: u32,
        }
        let header: Header = serde_json::from_str(&payload)
            .map_err(|e| Error::Queue(format!("bad envelope in {queue}: {e}")))?;
        Ok(Self { queue: queue.to_string(), id: header.id, attempts: header.attempts, payload })
    }

    /// 解析任务内容
    pub fn job(&self) -> Result<Job> {
        let envelope: Envelope = serde_json::from_str(&self.payload)?;
        Ok(envelope.job)
    }

    /// 失败次数加一后重新入队的 payload，任务内容保持原样
    fn retry_payload(&self) -> Result<String> {
        let mut envelope: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&self.payload)?;
        envelope.insert("attempts".to_string(), (self.attempts + 1).into());
        Ok(serde_json::to_string(&envelope)?)
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// 将任务放入其所属的队列，返回任务 ID
    async fn enqueue(&self, job: &Job) -> Result<u64>;

    /// 取出一个任务，lease 内未 ack 的任务会被重新投递
    async fn dequeue(&self, queue: &str, lease: Duration) -> Result<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// 失败次数加一后放回队尾，租约已过期的任务不会重复入队
    async fn nack(&self, delivery: &Delivery) -> Result<()>;

    /// 将租约已过期的任务放回队列，返回数量
    async fn reclaim_expired(&self, queue: &str) -> Result<usize>;

    /// 等待处理的任务数量
    async fn pending(&self, queue: &str) -> Result<usize>;
}
