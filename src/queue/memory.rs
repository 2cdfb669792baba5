use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Delivery, Envelope, Job, JobQueue};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<String>,
    /// payload -> 租约截止时间
    processing: HashMap<String, i64>,
}

/// 进程内任务队列
pub struct MemoryJobQueue {
    queues: Mutex<HashMap<String, QueueState>>,
    seq: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { queues: Mutex::default(), seq: AtomicU64::new(0), clock }
    }

    /// 正在处理中的任务数量
    pub async fn in_flight(&self, queue: &str) -> usize {
        self.queues.lock().await.get(queue).map_or(0, |q| q.processing.len())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<u64> {
        let id = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let payload = Envelope::encode(id, job)?;
        self.queues.lock().await.entry(job.queue().to_string()).or_default().ready.push_back(payload);
        Ok(id)
    }

    async fn dequeue(&self, queue: &str, lease: Duration) -> Result<Option<Delivery>> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };
        let Some(payload) = state.ready.pop_front() else {
            return Ok(None);
        };
        let deadline = self.clock.now_millis() + lease.as_millis() as i64;
        state.processing.insert(payload.clone(), deadline);
        Delivery::new(queue, payload).map(Some)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        if let Some(state) = self.queues.lock().await.get_mut(&delivery.queue) {
            state.processing.remove(&delivery.payload);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        let payload = delivery.retry_payload()?;
        let mut queues = self.queues.lock().await;
        let state = queues.entry(delivery.queue.clone()).or_default();
        // 租约已过期并被回收的任务不再重复入队
        if state.processing.remove(&delivery.payload).is_some() {
            state.ready.push_back(payload);
        }
        Ok(())
    }

    async fn reclaim_expired(&self, queue: &str) -> Result<usize> {
        let now = self.clock.now_millis();
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(0);
        };
        let mut expired = state
            .processing
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(payload, _)| payload.clone())
            .collect::<Vec<_>>();
        expired.sort();
        for payload in &expired {
            state.processing.remove(payload);
            state.ready.push_back(payload.clone());
        }
        Ok(expired.len())
    }

    async fn pending(&self, queue: &str) -> Result<usize> {
        Ok(self.queues.lock().await.get(queue).map_or(0, |q| q.ready.len()))
    }
}
