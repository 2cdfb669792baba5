//! 队列 worker
//!
//! 每个 worker 独立地循环：取任务、带超时执行、根据结果 ack 或 nack。
//! worker 之间不共享可变状态，所有协调都通过共享存储完成。

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};

use crate::cache::ImageCache;
use crate::clock::Clock;
use crate::db::{RecordStore, Store};
use crate::error::Result;
use crate::http::HttpFetch;
use crate::metrics;
use crate::neardup::NearDupIndex;
use crate::queue::{Delivery, JobQueue};
use crate::scraper::{CrawlConfig, SiteRegistry};
use crate::snowflake::{MAX_ID_PART, SnowflakeAllocator};

mod tasks;

pub use tasks::ProcessOutcome;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// 汉明距离小于该值视为重复
    pub threshold: u32,
    pub group_id: u8,
    /// 每个任务结束后的等待时间，限制对图站的请求频率
    pub job_delay: Duration,
    pub job_timeout: Duration,
    /// 暂时性错误的最大投递次数，达到后丢弃任务
    pub max_attempts: u32,
    /// 暂时性错误后重新入队前的等待时间，需小于租约余量
    pub retry_backoff: Duration,
    /// 队列为空时的轮询间隔
    pub poll_interval: Duration,
    pub crawl: CrawlConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threshold: 24,
            group_id: 0,
            job_delay: Duration::from_millis(500),
            job_timeout: Duration::from_secs(180),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            crawl: CrawlConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// 租约比超时多留一些余量，超时的任务在租约到期后才会被重新投递
    pub fn lease(&self) -> Duration {
        self.job_timeout + Duration::from_secs(30)
    }
}

/// worker 运行所需的全部依赖
pub struct WorkerContext {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn JobQueue>,
    pub http: Arc<dyn HttpFetch>,
    pub sites: SiteRegistry,
    pub cache: Option<ImageCache>,
    pub records: RecordStore,
    pub index: NearDupIndex,
    pub allocator: SnowflakeAllocator,
    pub config: WorkerConfig,
}

impl WorkerContext {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        http: Arc<dyn HttpFetch>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            records: RecordStore::new(store.clone()),
            index: NearDupIndex::new(store.clone()),
            allocator: SnowflakeAllocator::new(store.clone(), clock),
            sites: SiteRegistry::builtin(),
            cache: None,
            store,
            queue,
            http,
            config,
        }
    }

    pub fn with_sites(mut self, sites: SiteRegistry) -> Self {
        self.sites = sites;
        self
    }

    pub fn with_cache(mut self, cache: Option<ImageCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_allocator(mut self, allocator: SnowflakeAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    /// 处理一个已取出的任务并 ack / nack，无论结果如何都等待 job_delay
    async fn settle(&self, delivery: Delivery, worker_id: u8) -> Result<()> {
        let result = self.settle_inner(&delivery, worker_id).await;
        sleep(self.config.job_delay).await;
        result
    }

    async fn settle_inner(&self, delivery: &Delivery, worker_id: u8) -> Result<()> {
        let job = match delivery.job() {
            Ok(job) => job,
            Err(e) => {
                error!("任务 {} 格式错误，丢弃: {e}", delivery.id);
                return self.queue.ack(delivery).await;
            }
        };
        let name = job.name();
        debug!("worker {worker_id} 开始处理任务 {} ({name})，已失败 {} 次", delivery.id, delivery.attempts);

        let start = Instant::now();
        let result = timeout(self.config.job_timeout, self.handle_job(worker_id, job)).await;
        let elapsed = start.elapsed().as_secs_f64();

        match result {
            Ok(Ok(())) => {
                metrics::observe_job_duration(name, "ok", elapsed);
                self.queue.ack(delivery).await
            }
            Ok(Err(e)) if e.is_transient() && delivery.attempts + 1 < self.config.max_attempts => {
                metrics::observe_job_duration(name, "retry", elapsed);
                warn!("任务 {} ({name}) 第 {} 次失败，稍后重试: {e}", delivery.id, delivery.attempts + 1);
                sleep(self.config.retry_backoff).await;
                self.queue.nack(delivery).await
            }
            Ok(Err(e)) if e.is_transient() => {
                metrics::observe_job_duration(name, "abandoned", elapsed);
                error!("任务 {} ({name}) 失败 {} 次，放弃: {e}", delivery.id, delivery.attempts + 1);
                self.queue.ack(delivery).await
            }
            Ok(Err(e)) => {
                metrics::observe_job_duration(name, "failed", elapsed);
                error!("任务 {} ({name}) 失败: {e}", delivery.id);
                self.queue.ack(delivery).await
            }
            Err(_) => {
                // 不 ack，租约到期后由队列重新投递
                metrics::observe_job_duration(name, "timeout", elapsed);
                warn!("任务 {} ({name}) 超时，已放弃", delivery.id);
                Ok(())
            }
        }
    }

    /// 从队列取出并处理一个任务，队列为空时返回 false
    pub async fn run_once(&self, queue: &str, worker_id: u8) -> Result<bool> {
        match self.queue.dequeue(queue, self.config.lease()).await? {
            Some(delivery) => {
                self.settle(delivery, worker_id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 处理队列直到为空，返回处理的任务数量
    pub async fn drain(&self, queue: &str, worker_id: u8) -> Result<usize> {
        let mut count = 0;
        while self.run_once(queue, worker_id).await? {
            count += 1;
        }
        Ok(count)
    }
}

/// 单个 worker 的主循环，收到关闭信号后在当前任务结束时退出
pub async fn run_worker(
    ctx: Arc<WorkerContext>,
    queue: String,
    worker_id: u8,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("worker {worker_id} 开始监听队列 {queue}");
    while !*shutdown.borrow() {
        if let Err(e) = ctx.queue.reclaim_expired(&queue).await {
            warn!("回收过期任务失败: {e}");
        }
        let idle = match ctx.run_once(&queue, worker_id).await {
            Ok(handled) => !handled,
            Err(e) => {
                error!("worker {worker_id}: {e}");
                true
            }
        };
        if idle {
            tokio::select! {
                _ = sleep(ctx.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
    info!("worker {worker_id} 已退出");
}

/// 启动 n 个 worker，worker id 从 base_worker_id 开始依次递增
pub async fn run_pool(
    ctx: Arc<WorkerContext>,
    queue: &str,
    workers: usize,
    base_worker_id: u8,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if workers > usize::from(MAX_ID_PART) + 1 {
        warn!("worker 数量 {workers} 超过 {}，worker id 会重复", usize::from(MAX_ID_PART) + 1);
    }

    let mut set = JoinSet::new();
    for i in 0..workers {
        let worker_id = base_worker_id.wrapping_add(i as u8) & MAX_ID_PART;
        set.spawn(run_worker(ctx.clone(), queue.to_string(), worker_id, shutdown.clone()));
    }
    while let Some(result) = set.join_next().await {
        result?;
    }
    Ok(())
}
