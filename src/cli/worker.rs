use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use log::{error, info};
use prometheus::{BasicAuthentication, labels};
use tokio::sync::watch;
use tokio::task::spawn_blocking;
use tokio::time::sleep;

use crate::cli::{SubCommandExtend, connect};
use crate::clock::SystemClock;
use crate::config::{CrawlOptions, IndexOptions, Opts, WorkerOptions};
use crate::http::ReqwestFetcher;
use crate::queue::{CRAWL_QUEUE, INDEX_QUEUE};
use crate::worker::{WorkerConfig, WorkerContext, run_pool};

#[derive(Parser, Debug, Clone)]
pub struct WorkerCommand {
    #[command(flatten)]
    pub index: IndexOptions,
    #[command(flatten)]
    pub crawl: CrawlOptions,
    #[command(flatten)]
    pub worker: WorkerOptions,
}

impl WorkerCommand {
    fn prometheus_auth(&self) -> anyhow::Result<Option<(String, String)>> {
        let Some(auth) = &self.worker.prometheus_auth else {
            return Ok(None);
        };
        let Some((username, password)) = auth.split_once(':') else {
            bail!("prometheus 认证信息格式应为 username:password");
        };
        Ok(Some((username.to_string(), password.to_string())))
    }

    fn spawn_prometheus_push(&self, queue: &str) -> anyhow::Result<()> {
        let Some(url) = self.worker.prometheus_push.clone() else {
            return Ok(());
        };
        let instance = self.worker.prometheus_instance.clone().unwrap_or_else(|| queue.to_string());
        let auth = self.prometheus_auth()?;
        tokio::spawn(async move {
            loop {
                let metric_families = prometheus::gather();
                let url = url.clone();
                let instance = instance.clone();
                let auth = auth.clone();
                let r = spawn_blocking(move || {
                    prometheus::push_metrics(
                        "booru-index",
                        labels! {
                            "instance".to_string() => instance,
                        },
                        &url,
                        metric_families,
                        auth.map(|(username, password)| BasicAuthentication { username, password }),
                    )
                })
                .await;
                match r {
                    Ok(Err(e)) => error!("推送指标失败: {e}"),
                    Err(e) => error!("推送指标失败: {e}"),
                    Ok(Ok(())) => {}
                }
                sleep(Duration::from_secs(30)).await;
            }
        });
        Ok(())
    }

    pub async fn run_queue(&self, opts: &Opts, queue: &str, job_timeout_secs: u64) -> anyhow::Result<()> {
        let (store, job_queue) = connect(opts).await?;
        let http_timeout = Duration::from_secs(self.worker.http_timeout_secs);
        let http = ReqwestFetcher::new(http_timeout).context("failed to build http client")?;
        let job_timeout = Duration::from_secs(job_timeout_secs);
        let config = WorkerConfig::from_options(&self.index, &self.crawl, &self.worker, job_timeout);

        let ctx = WorkerContext::new(store, Arc::new(job_queue), Arc::new(http), Arc::new(SystemClock), config)
            .with_cache(self.index.cache());
        if let Some(cache) = &ctx.cache {
            info!("图片缓存目录: {}", cache.dir().display());
        }

        self.spawn_prometheus_push(queue)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("收到退出信号，等待当前任务结束");
                let _ = shutdown_tx.send(true);
            }
        });

        info!("启动 {} 个 worker，队列: {queue}", self.worker.workers);
        run_pool(Arc::new(ctx), queue, self.worker.workers, self.worker.worker_id, shutdown_rx).await?;
        Ok(())
    }
}

#[derive(Parser, Debug, Clone)]
pub struct IndexWorkerCommand {
    #[command(flatten)]
    pub inner: WorkerCommand,
    /// 单个索引任务的超时时间
    #[arg(long, value_name = "SECS", default_value_t = 180)]
    pub job_timeout_secs: u64,
}

impl SubCommandExtend for IndexWorkerCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        self.inner.run_queue(opts, INDEX_QUEUE, self.job_timeout_secs).await
    }
}

#[derive(Parser, Debug, Clone)]
pub struct CrawlWorkerCommand {
    #[command(flatten)]
    pub inner: WorkerCommand,
    /// 单个爬取任务的超时时间，一次爬取可能翻上千页
    #[arg(long, value_name = "SECS", default_value_t = 4 * 3600)]
    pub job_timeout_secs: u64,
}

impl SubCommandExtend for CrawlWorkerCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        self.inner.run_queue(opts, CRAWL_QUEUE, self.job_timeout_secs).await
    }
}
