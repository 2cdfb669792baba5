use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::{Delivery, Envelope, Job, JobQueue};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};

const SEQ_KEY: &str = "queue:seq";

/// KEYS: ready, processing; ARGV: deadline
static DEQUEUE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local payload = redis.call('RPOP', KEYS[1])
        if not payload then
            return false
        end
        redis.call('ZADD', KEYS[2], ARGV[1], payload)
        return payload
    "#,
    )
});

/// 放回队尾，worker 从右端取任务，所以队尾在左端
///
/// KEYS: ready, processing; ARGV: payload, retry_payload
static NACK: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        if redis.call('ZREM', KEYS[2], ARGV[1]) == 1 then
            redis.call('LPUSH', KEYS[1], ARGV[2])
        end
        return 1
    "#,
    )
});

/// KEYS: ready, processing; ARGV: now
static RECLAIM: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
        for _, payload in ipairs(expired) do
            redis.call('ZREM', KEYS[2], payload)
            redis.call('LPUSH', KEYS[1], payload)
        end
        return #expired
    "#,
    )
});

fn ready_key(queue: &str) -> String {
    format!("queue:{queue}")
}

fn processing_key(queue: &str) -> String {
    format!("queue:{queue}:processing")
}

/// 基于 Redis 列表的任务队列
///
/// 新任务 LPUSH 到 `queue:<name>`，worker 从右端取出并登记到 `queue:<name>:processing`，
/// 分数为租约截止时间。
#[derive(Clone)]
pub struct RedisJobQueue {
    conn: ConnectionManager,
    clock: Arc<dyn Clock>,
}

impl RedisJobQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn, clock: Arc::new(SystemClock) }
    }

    fn queue_error(e: redis::RedisError) -> Error {
        Error::Queue(e.to_string())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<u64> {
        let mut conn = self.conn.clone();
        let id: u64 = conn.incr(SEQ_KEY, 1).await.map_err(Self::queue_error)?;
        let payload = Envelope::encode(id, job)?;
        conn.lpush::<_, _, ()>(ready_key(job.queue()), payload).await.map_err(Self::queue_error)?;
        Ok(id)
    }

    async fn dequeue(&self, queue: &str, lease: Duration) -> Result<Option<Delivery>> {
        let mut conn = self.conn.clone();
        let deadline = self.clock.now_millis() + lease.as_millis() as i64;
        let payload: Option<String> = DEQUEUE
            .key(ready_key(queue))
            .key(processing_key(queue))
            .arg(deadline)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::queue_error)?;
        payload.map(|p| Delivery::new(queue, p)).transpose()
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(processing_key(&delivery.queue), &delivery.payload)
            .await
            .map_err(Self::queue_error)
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        let retry = delivery.retry_payload()?;
        let mut conn = self.conn.clone();
        let _: i64 = NACK
            .key(ready_key(&delivery.queue))
            .key(processing_key(&delivery.queue))
            .arg(&delivery.payload)
            .arg(retry)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::queue_error)?;
        Ok(())
    }

    async fn reclaim_expired(&self, queue: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let count: usize = RECLAIM
            .key(ready_key(queue))
            .key(processing_key(queue))
            .arg(self.clock.now_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(Self::queue_error)?;
        Ok(count)
    }

    async fn pending(&self, queue: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        conn.llen(ready_key(queue)).await.map_err(Self::queue_error)
    }
}
