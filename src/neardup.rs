//! 基于分桶的近似重复检索
//!
//! 每个指纹按 (字节偏移, 字节值) 写入 N 个桶。查询时取所有对应桶的并集作为候选，
//! 再逐个计算精确的汉明距离。距离小于 8 的两个指纹至少有一个字节完全相同，
//! 因此阈值超过位长的 1/4 时可能漏掉每个字节都不同的匹配。

use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;

use crate::db::{Op, Store, keys};
use crate::error::{Error, Result};
use crate::imhash::{FINGERPRINT_LEN, Fingerprint};

/// 一条检索结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Neighbor {
    pub fingerprint: Fingerprint,
    pub distance: u32,
}

pub struct NearDupIndex {
    store: Arc<dyn Store>,
}

/// 查询指纹对应的所有桶
fn bucket_keys(fp: &[u8]) -> Vec<Vec<u8>> {
    fp.iter().enumerate().map(|(i, &v)| keys::hash_bucket(i, v)).collect()
}

/// 插入指纹所需的写操作，供记录写入时合并到同一事务
pub fn insert_ops(fp: &Fingerprint, img_id: u64) -> Vec<Op> {
    let bytes = fp.as_bytes();
    let mut ops = bucket_keys(bytes)
        .into_iter()
        .map(|key| Op::sadd(key, [bytes.to_vec()]))
        .collect::<Vec<_>>();
    ops.push(Op::set(keys::imhash(bytes), img_id.to_string()));
    ops
}

impl NearDupIndex {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// 取出候选指纹，跳过长度不正确的脏数据
    async fn candidates(&self, fp: &[u8]) -> Result<Vec<Fingerprint>> {
        if fp.len() != FINGERPRINT_LEN {
            return Err(Error::InvalidFingerprint(fp.len()));
        }
        let members = self.store.sunion(&bucket_keys(fp)).await?;
        debug!("候选指纹数量: {}", members.len());

        let mut candidates = Vec::with_capacity(members.len());
        for member in members {
            match Fingerprint::try_from(member.as_slice()) {
                Ok(candidate) => candidates.push(candidate),
                Err(_) => warn!("跳过长度为 {} 的候选指纹", member.len()),
            }
        }
        Ok(candidates)
    }

    /// 是否存在距离小于 threshold 的已索引指纹
    pub async fn exists(&self, fp: &[u8], threshold: u32) -> Result<bool> {
        let query = Fingerprint::try_from(fp)?;
        let candidates = self.candidates(fp).await?;
        Ok(candidates.iter().any(|c| query.distance(c) < threshold))
    }

    /// 返回所有距离小于 threshold 的指纹，按距离升序排列
    pub async fn search(&self, fp: &[u8], threshold: u32) -> Result<Vec<Neighbor>> {
        let query = Fingerprint::try_from(fp)?;
        let mut result = self
            .candidates(fp)
            .await?
            .into_iter()
            .map(|fingerprint| Neighbor { distance: query.distance(&fingerprint), fingerprint })
            .filter(|n| n.distance < threshold)
            .collect::<Vec<_>>();
        result.sort_by(|a, b| a.distance.cmp(&b.distance).then_with(|| a.fingerprint.cmp(&b.fingerprint)));
        Ok(result)
    }

    pub async fn insert(&self, fp: &Fingerprint, img_id: u64) -> Result<()> {
        self.store.exec(insert_ops(fp, img_id)).await
    }

    /// 指纹对应的图片 ID
    pub async fn lookup(&self, fp: &Fingerprint) -> Result<Option<u64>> {
        let Some(value) = self.store.get(&keys::imhash(fp.as_bytes())).await? else {
            return Ok(None);
        };
        let id = std::str::from_utf8(&value)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Malformed(format!("imhash entry for {fp}")))?;
        Ok(Some(id))
    }
}
