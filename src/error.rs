use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// 索引中不存在该图片
    #[error("image {0} not found in index")]
    NotFound(u64),
    /// 指纹长度不正确
    #[error("invalid fingerprint length: {0}")]
    InvalidFingerprint(usize),
    /// 两个指纹长度不一致，无法计算距离
    #[error("fingerprint length mismatch: {left} != {right}")]
    LengthMismatch { left: usize, right: usize },
    /// 爬取超过重试上限，本次爬取终止
    #[error("crawl of {site} aborted at page {page}: {reason}")]
    CrawlAborted { site: String, page: u32, reason: String },
    /// 下载失败或返回了非 2xx 状态码
    #[error("failed to download {url}: {reason}")]
    DownloadFailure { url: String, reason: String },
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("store error: {0}")]
    Store(String),
    #[error("queue error: {0}")]
    Queue(String),
    /// 存储中的记录缺少字段或格式错误
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("unknown site: {0}")]
    UnknownSite(String),
    #[error("unknown rating: {0}")]
    UnknownRating(String),
    #[error("invalid search terms: {0}")]
    InvalidTerms(String),
    /// 时钟回拨或序列号耗尽，且在重试上限内没有恢复
    #[error("snowflake allocator {group}:{worker} stalled after {retries} retries")]
    AllocatorStalled { group: u8, worker: u8, retries: u32 },
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// 是否为暂时性错误
    ///
    /// 暂时性错误由队列重新投递来重试，其余错误对当前任务是致命的
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DownloadFailure { .. }
                | Self::Http(_)
                | Self::Store(_)
                | Self::Queue(_)
                | Self::Io(_)
                | Self::Task(_)
                | Self::AllocatorStalled { .. }
        )
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::Store(err.to_string())
    }
}
