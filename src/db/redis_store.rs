use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::{Guard, Op, Store};
use crate::error::Result;

/// 所有前置条件成立时按顺序执行扁平化的命令
///
/// KEYS: 前置条件的键；ARGV 布局：(kind, member)*，随后是 (cmd, argc, args...)*。
/// 写入的键只出现在 ARGV 中，没有声明在 KEYS 里，只能用于单机 Redis，不支持 Redis Cluster。
static GUARDED_EXEC: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        for g = 1, #KEYS do
            local kind, member = ARGV[2 * g - 1], ARGV[2 * g]
            if kind == 'not_member' then
                if redis.call('SISMEMBER', KEYS[g], member) == 1 then
                    return 0
                end
            elseif redis.call('EXISTS', KEYS[g]) == 1 then
                return 0
            end
        end
        local i = 2 * #KEYS + 1
        while i <= #ARGV do
            local n = tonumber(ARGV[i + 1])
            redis.call(ARGV[i], unpack(ARGV, i + 2, i + 1 + n))
            i = i + 2 + n
        end
        return 1
    "#,
    )
});

/// ARGV: has_expected, expected, value
static COMPARE_AND_SWAP: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local current = redis.call('GET', KEYS[1])
        if ARGV[1] == '0' then
            if current then
                return 0
            end
        elseif current ~= ARGV[2] then
            return 0
        end
        redis.call('SET', KEYS[1], ARGV[3])
        return 1
    "#,
    )
});

/// 基于 Redis 的共享存储
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }

    /// 供其他组件复用同一个连接
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn exists(&self, key: &[u8]) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn sismember(&self, key: &[u8], member: &[u8]) -> Result<bool> {
        let mut conn = self.conn.clone();
        let found: bool = conn.sismember(key, member).await?;
        Ok(found)
    }

    async fn smembers(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let members: Vec<Vec<u8>> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn sunion(&self, keys: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        if keys.is_empty() {
            return Ok(vec![]);
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SUNION");
        for key in keys {
            cmd.arg(key.as_slice());
        }
        let members: Vec<Vec<u8>> = cmd.query_async(&mut conn).await?;
        Ok(members)
    }

    async fn hgetall(&self, key: &[u8]) -> Result<HashMap<String, Vec<u8>>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, Vec<u8>> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn zrange_withscores(&self, key: &[u8]) -> Result<Vec<(Vec<u8>, f64)>> {
        let mut conn = self.conn.clone();
        let items: Vec<(Vec<u8>, f64)> = conn.zrange_withscores(key, 0, -1).await?;
        Ok(items)
    }

    async fn zscore(&self, key: &[u8], member: &[u8]) -> Result<Option<f64>> {
        let mut conn = self.conn.clone();
        let score: Option<f64> = conn.zscore(key, member).await?;
        Ok(score)
    }

    async fn exec(&self, ops: Vec<Op>) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops.iter().filter(|op| !op.is_noop()) {
            let (name, args) = op.to_args();
            let mut cmd = redis::cmd(name);
            for arg in &args {
                cmd.arg(arg.as_slice());
            }
            pipe.add_command(cmd).ignore();
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn exec_guarded(&self, guards: Vec<Guard>, ops: Vec<Op>) -> Result<bool> {
        let mut invocation = GUARDED_EXEC.prepare_invoke();
        for guard in &guards {
            invocation.key(guard.key());
        }
        for guard in &guards {
            match guard {
                Guard::NotMember { member, .. } => invocation.arg("not_member").arg(member.as_slice()),
                Guard::NotExists { .. } => invocation.arg("not_exists").arg(""),
            };
        }
        for op in ops.iter().filter(|op| !op.is_noop()) {
            let (name, args) = op.to_args();
            invocation.arg(name).arg(args.len());
            for arg in &args {
                invocation.arg(arg.as_slice());
            }
        }
        let mut conn = self.conn.clone();
        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(applied == 1)
    }

    async fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let swapped: i64 = COMPARE_AND_SWAP
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }
}
