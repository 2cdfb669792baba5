use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Guard, Op, Store};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
enum Value {
    Str(Vec<u8>),
    Set(BTreeSet<Vec<u8>>),
    Hash(HashMap<String, Vec<u8>>),
    ZSet(BTreeMap<Vec<u8>, f64>),
}

/// 进程内存储，所有操作在同一把锁下执行，语义上与 Redis 的事务一致
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<Vec<u8>, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前键的数量
    pub async fn len(&self) -> usize {
        self.data.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.lock().await.is_empty()
    }
}

fn wrong_type(key: &[u8]) -> Error {
    Error::Store(format!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        String::from_utf8_lossy(key)
    ))
}

fn as_set<'a>(
    data: &'a mut HashMap<Vec<u8>, Value>,
    key: &[u8],
) -> Result<&'a mut BTreeSet<Vec<u8>>> {
    match data.entry(key.to_vec()).or_insert_with(|| Value::Set(BTreeSet::new())) {
        Value::Set(set) => Ok(set),
        _ => Err(wrong_type(key)),
    }
}

fn as_zset<'a>(
    data: &'a mut HashMap<Vec<u8>, Value>,
    key: &[u8],
) -> Result<&'a mut BTreeMap<Vec<u8>, f64>> {
    match data.entry(key.to_vec()).or_insert_with(|| Value::ZSet(BTreeMap::new())) {
        Value::ZSet(zset) => Ok(zset),
        _ => Err(wrong_type(key)),
    }
}

fn as_hash<'a>(
    data: &'a mut HashMap<Vec<u8>, Value>,
    key: &[u8],
) -> Result<&'a mut HashMap<String, Vec<u8>>> {
    match data.entry(key.to_vec()).or_insert_with(|| Value::Hash(HashMap::new())) {
        Value::Hash(hash) => Ok(hash),
        _ => Err(wrong_type(key)),
    }
}

fn apply_op(data: &mut HashMap<Vec<u8>, Value>, op: Op) -> Result<()> {
    match op {
        Op::Set { key, value } => {
            data.insert(key, Value::Str(value));
        }
        Op::Del { key } => {
            data.remove(&key);
        }
        Op::SAdd { key, members } => as_set(data, &key)?.extend(members),
        Op::SRem { key, members } => {
            let set = as_set(data, &key)?;
            for m in &members {
                set.remove(m);
            }
            if set.is_empty() {
                data.remove(&key);
            }
        }
        Op::HSet { key, fields } => as_hash(data, &key)?.extend(fields),
        Op::ZAdd { key, members } => as_zset(data, &key)?.extend(members),
        Op::ZRem { key, members } => {
            let zset = as_zset(data, &key)?;
            for m in &members {
                zset.remove(m);
            }
            if zset.is_empty() {
                data.remove(&key);
            }
        }
    }
    Ok(())
}

fn op_key(op: &Op) -> &[u8] {
    match op {
        Op::Set { key, .. }
        | Op::Del { key }
        | Op::SAdd { key, .. }
        | Op::SRem { key, .. }
        | Op::HSet { key, .. }
        | Op::ZAdd { key, .. }
        | Op::ZRem { key, .. } => key,
    }
}

/// 执行一组操作，任意一步失败时恢复所有被修改的键
fn apply_all(data: &mut HashMap<Vec<u8>, Value>, ops: Vec<Op>) -> Result<()> {
    let ops = ops.into_iter().filter(|op| !op.is_noop()).collect::<Vec<_>>();
    let mut backup = HashMap::new();
    for op in &ops {
        let key = op_key(op);
        if !backup.contains_key(key) {
            backup.insert(key.to_vec(), data.get(key).cloned());
        }
    }
    for op in ops {
        if let Err(e) = apply_op(data, op) {
            for (key, value) in backup {
                match value {
                    Some(value) => data.insert(key, value),
                    None => data.remove(&key),
                };
            }
            return Err(e);
        }
    }
    Ok(())
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.data.lock().await.get(key) {
            None => Ok(None),
            Some(Value::Str(v)) => Ok(Some(v.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.data.lock().await.contains_key(key))
    }

    async fn sismember(&self, key: &[u8], member: &[u8]) -> Result<bool> {
        match self.data.lock().await.get(key) {
            None => Ok(false),
            Some(Value::Set(set)) => Ok(set.contains(member)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn smembers(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        match self.data.lock().await.get(key) {
            None => Ok(vec![]),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn sunion(&self, keys: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        let data = self.data.lock().await;
        let mut union = BTreeSet::new();
        for key in keys {
            match data.get(key) {
                None => {}
                Some(Value::Set(set)) => union.extend(set.iter().cloned()),
                Some(_) => return Err(wrong_type(key)),
            }
        }
        Ok(union.into_iter().collect())
    }

    async fn hgetall(&self, key: &[u8]) -> Result<HashMap<String, Vec<u8>>> {
        match self.data.lock().await.get(key) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zrange_withscores(&self, key: &[u8]) -> Result<Vec<(Vec<u8>, f64)>> {
        match self.data.lock().await.get(key) {
            None => Ok(vec![]),
            Some(Value::ZSet(zset)) => {
                let mut items = zset.iter().map(|(m, s)| (m.clone(), *s)).collect::<Vec<_>>();
                items.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                Ok(items)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zscore(&self, key: &[u8], member: &[u8]) -> Result<Option<f64>> {
        match self.data.lock().await.get(key) {
            None => Ok(None),
            Some(Value::ZSet(zset)) => Ok(zset.get(member).copied()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn exec(&self, ops: Vec<Op>) -> Result<()> {
        let mut data = self.data.lock().await;
        apply_all(&mut data, ops)
    }

    async fn exec_guarded(&self, guards: Vec<Guard>, ops: Vec<Op>) -> Result<bool> {
        let mut data = self.data.lock().await;
        for guard in &guards {
            let holds = match (guard, data.get(guard.key())) {
                (_, None) => true,
                (Guard::NotExists { .. }, Some(_)) => false,
                (Guard::NotMember { member, .. }, Some(Value::Set(set))) => !set.contains(member),
                (Guard::NotMember { key, .. }, Some(_)) => return Err(wrong_type(key)),
            };
            if !holds {
                return Ok(false);
            }
        }
        apply_all(&mut data, ops)?;
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> Result<bool> {
        let mut data = self.data.lock().await;
        let current = match data.get(key) {
            None => None,
            Some(Value::Str(v)) => Some(v.as_slice()),
            Some(_) => return Err(wrong_type(key)),
        };
        if current != expected {
            return Ok(false);
        }
        data.insert(key.to_vec(), Value::Str(value.to_vec()));
        Ok(true)
    }
}
