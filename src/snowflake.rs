//! Snowflake ID 分配
//!
//! 布局：`[42 位毫秒时间戳 | 5 位 group | 5 位 worker | 12 位序列号]`，时间戳从 [`EPOCH`] 起算。
//! 每个 (group, worker) 的最后一个 ID 保存在共享存储中，通过 compare-and-swap 更新，
//! 标记不会过期，因此两个并发的分配者不会拿到相同的 ID。

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::sleep;

use crate::clock::Clock;
use crate::db::{Store, keys};
use crate::error::{Error, Result};

/// 2018-11-30T00:00:00Z
pub const EPOCH: i64 = 1_543_536_000_000;

const WORKER_BITS: u32 = 5;
const GROUP_BITS: u32 = 5;
const SEQUENCE_BITS: u32 = 12;

pub const MAX_ID_PART: u8 = (1 << WORKER_BITS) - 1;
pub const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;

const WORKER_SHIFT: u32 = SEQUENCE_BITS;
const GROUP_SHIFT: u32 = SEQUENCE_BITS + WORKER_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + WORKER_BITS + GROUP_BITS;

/// 序列号耗尽后等待下一个毫秒的时间
const OVERFLOW_WAIT: Duration = Duration::from_millis(10);

/// 拆解后的 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snowflake {
    /// 相对 [`EPOCH`] 的毫秒数
    pub timestamp: u64,
    pub group_id: u8,
    pub worker_id: u8,
    pub sequence: u16,
}

impl Snowflake {
    pub fn to_id(self) -> u64 {
        (self.timestamp << TIMESTAMP_SHIFT)
            | (u64::from(self.group_id & MAX_ID_PART) << GROUP_SHIFT)
            | (u64::from(self.worker_id & MAX_ID_PART) << WORKER_SHIFT)
            | u64::from(self.sequence & MAX_SEQUENCE)
    }

    /// Unix 毫秒时间戳
    pub fn unix_millis(&self) -> i64 {
        self.timestamp as i64 + EPOCH
    }
}

pub fn compose(timestamp: u64, group_id: u8, worker_id: u8, sequence: u16) -> u64 {
    Snowflake { timestamp, group_id, worker_id, sequence }.to_id()
}

pub fn decompose(id: u64) -> Snowflake {
    Snowflake {
        timestamp: id >> TIMESTAMP_SHIFT,
        group_id: ((id >> GROUP_SHIFT) & u64::from(MAX_ID_PART)) as u8,
        worker_id: ((id >> WORKER_SHIFT) & u64::from(MAX_ID_PART)) as u8,
        sequence: (id & u64::from(MAX_SEQUENCE)) as u16,
    }
}

/// ID 中记录的创建时间，Unix 毫秒
pub fn timestamp_of(id: u64) -> i64 {
    decompose(id).unix_millis()
}

pub struct SnowflakeAllocator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
}

impl SnowflakeAllocator {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock, max_retries: 100 }
    }

    /// 时钟回拨或序列号耗尽时最多等待的次数
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub async fn allocate(&self, group_id: u8, worker_id: u8) -> Result<u64> {
        let (group_id, worker_id) = (group_id & MAX_ID_PART, worker_id & MAX_ID_PART);
        let key = keys::snowflake(group_id, worker_id);
        let mut retries = 0;

        loop {
            let marker = self.store.get(key.as_bytes()).await?;
            let last = marker.as_deref().map(parse_marker).transpose()?.map(decompose);
            let now = (self.clock.now_millis() - EPOCH).max(0) as u64;

            let wait = match last {
                Some(last) if now < last.timestamp => {
                    let skew = last.timestamp - now;
                    warn!("时钟回拨 {skew}ms，等待后重试");
                    Some(Duration::from_millis(skew))
                }
                Some(last) if now == last.timestamp && last.sequence >= MAX_SEQUENCE => {
                    debug!("序列号耗尽，等待下一个毫秒");
                    Some(OVERFLOW_WAIT)
                }
                _ => None,
            };
            if let Some(wait) = wait {
                if retries >= self.max_retries {
                    return Err(Error::AllocatorStalled {
                        group: group_id,
                        worker: worker_id,
                        retries,
                    });
                }
                retries += 1;
                sleep(wait).await;
                continue;
            }

            let sequence = match last {
                Some(last) if now == last.timestamp => last.sequence + 1,
                _ => 0,
            };
            let id = compose(now, group_id, worker_id, sequence);
            let marker = marker.as_deref();
            if self.store.compare_and_swap(key.as_bytes(), marker, id.to_string().as_bytes()).await? {
                return Ok(id);
            }
            debug!("{key} 已被其他分配者更新，重新读取");
        }
    }
}

fn parse_marker(marker: &[u8]) -> Result<u64> {
    std::str::from_utf8(marker)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Malformed(format!("snowflake marker {:?}", String::from_utf8_lossy(marker))))
}
