use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;

pub mod crud;
pub mod keys;
pub mod memory;
pub mod model;
pub mod redis_store;

pub use crud::RecordStore;
pub use memory::MemoryStore;
pub use model::*;
pub use redis_store::RedisStore;

/// 一次事务中的单个写操作
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Set { key: Vec<u8>, value: Vec<u8> },
    Del { key: Vec<u8> },
    SAdd { key: Vec<u8>, members: Vec<Vec<u8>> },
    SRem { key: Vec<u8>, members: Vec<Vec<u8>> },
    HSet { key: Vec<u8>, fields: Vec<(String, Vec<u8>)> },
    ZAdd { key: Vec<u8>, members: Vec<(Vec<u8>, f64)> },
    ZRem { key: Vec<u8>, members: Vec<Vec<u8>> },
}

impl Op {
    pub fn set(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::Set { key: key.into(), value: value.into() }
    }

    pub fn del(key: impl Into<Vec<u8>>) -> Self {
        Self::Del { key: key.into() }
    }

    pub fn sadd<I, M>(key: impl Into<Vec<u8>>, members: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<Vec<u8>>,
    {
        Self::SAdd { key: key.into(), members: members.into_iter().map(Into::into).collect() }
    }

    pub fn srem<I, M>(key: impl Into<Vec<u8>>, members: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<Vec<u8>>,
    {
        Self::SRem { key: key.into(), members: members.into_iter().map(Into::into).collect() }
    }

    pub fn zadd<I, M>(key: impl Into<Vec<u8>>, members: I) -> Self
    where
        I: IntoIterator<Item = (M, f64)>,
        M: Into<Vec<u8>>,
    {
        let members = members.into_iter().map(|(m, s)| (m.into(), s)).collect();
        Self::ZAdd { key: key.into(), members }
    }

    pub fn zrem<I, M>(key: impl Into<Vec<u8>>, members: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<Vec<u8>>,
    {
        Self::ZRem { key: key.into(), members: members.into_iter().map(Into::into).collect() }
    }

    /// 成员为空的集合操作在 Redis 中会报错，执行前直接跳过
    pub fn is_noop(&self) -> bool {
        match self {
            Self::SAdd { members, .. } | Self::SRem { members, .. } | Self::ZRem { members, .. } => {
                members.is_empty()
            }
            Self::ZAdd { members, .. } => members.is_empty(),
            Self::HSet { fields, .. } => fields.is_empty(),
            _ => false,
        }
    }

    /// 转换为 Redis 命令名和参数
    pub fn to_args(&self) -> (&'static str, Vec<Vec<u8>>) {
        match self {
            Self::Set { key, value } => ("SET", vec![key.clone(), value.clone()]),
            Self::Del { key } => ("DEL", vec![key.clone()]),
            Self::SAdd { key, members } => ("SADD", with_key(key, members.iter().cloned())),
            Self::SRem { key, members } => ("SREM", with_key(key, members.iter().cloned())),
            Self::HSet { key, fields } => {
                let args = fields.iter().flat_map(|(f, v)| [f.clone().into_bytes(), v.clone()]);
                ("HSET", with_key(key, args))
            }
            Self::ZAdd { key, members } => {
                let args =
                    members.iter().flat_map(|(m, s)| [s.to_string().into_bytes(), m.clone()]);
                ("ZADD", with_key(key, args))
            }
            Self::ZRem { key, members } => ("ZREM", with_key(key, members.iter().cloned())),
        }
    }
}

fn with_key(key: &[u8], rest: impl Iterator<Item = Vec<u8>>) -> Vec<Vec<u8>> {
    std::iter::once(key.to_vec()).chain(rest).collect()
}

/// 事务执行的前置条件
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// 仅当 member 不在集合 key 中时执行
    NotMember { key: Vec<u8>, member: Vec<u8> },
    /// 仅当 key 不存在时执行
    NotExists { key: Vec<u8> },
}

impl Guard {
    pub fn key(&self) -> &[u8] {
        match self {
            Self::NotMember { key, .. } | Self::NotExists { key } => key,
        }
    }
}

/// 共享存储，所有 worker 之间唯一的同步点
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn exists(&self, key: &[u8]) -> Result<bool>;

    async fn sismember(&self, key: &[u8], member: &[u8]) -> Result<bool>;

    async fn smembers(&self, key: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// 返回多个集合的并集
    async fn sunion(&self, keys: &[Vec<u8>]) -> Result<Vec<Vec<u8>>>;

    async fn hgetall(&self, key: &[u8]) -> Result<HashMap<String, Vec<u8>>>;

    /// 按分数升序返回有序集合的全部成员
    async fn zrange_withscores(&self, key: &[u8]) -> Result<Vec<(Vec<u8>, f64)>>;

    async fn zscore(&self, key: &[u8], member: &[u8]) -> Result<Option<f64>>;

    /// 原子地执行一组写操作，并发读取者要么看到全部结果，要么一个都看不到
    async fn exec(&self, ops: Vec<Op>) -> Result<()>;

    /// 在所有前置条件都成立时原子地执行一组写操作，返回是否执行
    async fn exec_guarded(&self, guards: Vec<Guard>, ops: Vec<Op>) -> Result<bool>;

    /// 当 key 的当前值等于 expected 时写入 value，expected 为 None 表示 key 不存在
    async fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> Result<bool>;
}
