mod associate;
mod crawl;
mod rename;
mod search;
mod show;
pub mod worker;

pub use associate::*;
pub use crawl::*;
pub use rename::*;
pub use search::*;
pub use show::*;
pub use worker::*;

use std::sync::Arc;

use log::debug;

use crate::config::Opts;
use crate::db::{RedisStore, Store};
use crate::queue::RedisJobQueue;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

/// 连接 Redis，存储与队列共用同一个连接
pub(crate) async fn connect(opts: &Opts) -> anyhow::Result<(Arc<dyn Store>, RedisJobQueue)> {
    debug!("连接 {}", opts.redis);
    let store = RedisStore::connect(&opts.redis).await?;
    let queue = RedisJobQueue::new(store.connection());
    Ok((Arc::new(store), queue))
}
