use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;

use crate::cache::ImageCache;
use crate::cli::*;
use crate::scraper::CrawlConfig;
use crate::worker::WorkerConfig;

static CACHE_DIR: LazyLock<Option<PathBuf>> = LazyLock::new(|| {
    ProjectDirs::from("", "booru-index", "booru-index").map(|dirs| dirs.cache_dir().join("images"))
});

#[derive(Parser, Debug, Clone)]
pub struct IndexOptions {
    /// 汉明距离小于该值的两张图片视为重复
    #[arg(long, value_name = "N", default_value_t = 24, value_parser = clap::value_parser!(u32).range(1..=128))]
    pub threshold: u32,
    /// Snowflake ID 的 group id
    #[arg(long, value_name = "ID", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..32))]
    pub group_id: u8,
    /// 每个索引任务结束后的等待时间
    #[arg(long, value_name = "MS", default_value_t = 500)]
    pub job_delay_ms: u64,
    /// 图片缓存目录，默认为系统缓存目录
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,
    /// 不缓存图片
    #[arg(long)]
    pub no_cache: bool,
}

impl IndexOptions {
    pub fn cache(&self) -> Option<ImageCache> {
        if self.no_cache {
            return None;
        }
        self.cache_dir.clone().or_else(|| CACHE_DIR.clone()).map(ImageCache::new)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct CrawlOptions {
    /// 两次翻页之间的间隔
    #[arg(long, value_name = "MS", default_value_t = 500)]
    pub page_delay_ms: u64,
    /// 单次爬取的最大页数
    #[arg(long, value_name = "N", default_value_t = 1000)]
    pub max_pages: u32,
    /// 单页最大重试次数，超过后放弃本次爬取
    #[arg(long, value_name = "N", default_value_t = 5)]
    pub max_retries: u32,
    /// 每页帖子数量
    #[arg(long, value_name = "N", default_value_t = 200)]
    pub page_limit: u32,
}

impl From<&CrawlOptions> for CrawlConfig {
    fn from(opts: &CrawlOptions) -> Self {
        Self {
            page_delay: Duration::from_millis(opts.page_delay_ms),
            max_pages: opts.max_pages,
            max_retries: opts.max_retries,
            page_limit: opts.page_limit,
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct WorkerOptions {
    /// worker 数量
    #[arg(short, long, value_name = "N", default_value_t = num_cpus::get())]
    pub workers: usize,
    /// 第一个 worker 的 id，其余 worker 依次递增
    #[arg(long, value_name = "ID", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..32))]
    pub worker_id: u8,
    /// 单个 HTTP 请求的超时时间
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    pub http_timeout_secs: u64,
    /// 下载失败等暂时性错误的最大投递次数
    #[arg(long, value_name = "N", default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_attempts: u32,
    /// 暂时性错误后重新入队前的等待时间
    #[arg(long, value_name = "MS", default_value_t = 5000)]
    pub retry_backoff_ms: u64,
    /// prometheus 主动推送地址
    #[arg(long, value_name = "URL")]
    pub prometheus_push: Option<String>,
    /// 自定义 instance 标签值
    #[arg(long, value_name = "NAME")]
    pub prometheus_instance: Option<String>,
    /// prometheus 认证信息，格式为 username:password
    #[arg(long, value_name = "AUTH")]
    pub prometheus_auth: Option<String>,
}

impl WorkerConfig {
    pub fn from_options(
        index: &IndexOptions,
        crawl: &CrawlOptions,
        worker: &WorkerOptions,
        job_timeout: Duration,
    ) -> Self {
        Self {
            threshold: index.threshold,
            group_id: index.group_id,
            job_delay: Duration::from_millis(index.job_delay_ms),
            job_timeout,
            max_attempts: worker.max_attempts,
            retry_backoff: Duration::from_millis(worker.retry_backoff_ms),
            crawl: crawl.into(),
            ..Default::default()
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "booru-index", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// Redis 地址
    #[arg(long, env = "BOORU_INDEX_REDIS", default_value = "redis://127.0.0.1:6379")]
    pub redis: String,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 处理索引队列
    IndexWorker(IndexWorkerCommand),
    /// 处理爬虫队列
    CrawlWorker(CrawlWorkerCommand),
    /// 将角色的爬取任务加入队列
    Crawl(CrawlCommand),
    /// 关联角色与图站搜索标签
    Associate(AssociateCommand),
    /// 显示一条图片记录
    Show(ShowCommand),
    /// 在索引中查找与本地图片近似的图片
    Search(SearchCommand),
    /// 将一个角色的所有图片合并到另一个角色名下
    RenameCharacter(RenameCharacterCommand),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Opts {
        Opts::try_parse_from(std::iter::once("booru-index").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_crawl_worker_timeout_is_hours() {
        let SubCommand::CrawlWorker(cmd) = parse(&["crawl-worker"]).subcmd else {
            panic!("expected crawl-worker");
        };
        assert_eq!(cmd.job_timeout_secs, 4 * 3600);
        assert_eq!(cmd.inner.worker.http_timeout_secs, 60);

        // 最多 1000 页、每页间隔 500ms 的爬取必须能在超时前完成
        let crawl = CrawlConfig::from(&cmd.inner.crawl);
        assert!(crawl.page_delay * crawl.max_pages < Duration::from_secs(cmd.job_timeout_secs));
    }

    #[test]
    fn test_index_worker_defaults() {
        let SubCommand::IndexWorker(cmd) = parse(&["index-worker", "--max-attempts", "5"]).subcmd else {
            panic!("expected index-worker");
        };
        assert_eq!(cmd.job_timeout_secs, 180);

        let job_timeout = Duration::from_secs(cmd.job_timeout_secs);
        let config = WorkerConfig::from_options(&cmd.inner.index, &cmd.inner.crawl, &cmd.inner.worker, job_timeout);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.retry_backoff, Duration::from_secs(5));
        assert!(config.retry_backoff < config.lease() - config.job_timeout);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        assert!(Opts::try_parse_from(["booru-index", "index-worker", "--max-attempts", "0"]).is_err());
    }
}
