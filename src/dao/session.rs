//! 会话状态缓存
//!
//! - `mid_{mid}`：哈希，连接 key -> comet 节点
//! - `key_{key}`：字符串，comet 节点
//! - `ol_{server}`：JSON，节点在线快照
//!
//! 所有写入都会设置 `redis_expire` 过期时间。

use std::collections::HashMap;

use tracing::debug;

use super::Dao;
use crate::domain::model::Online;
use crate::error::DaoResult;
use crate::infrastructure::cache::CommandKind;

const PREFIX_MID_SERVER: &str = "mid_";
const PREFIX_KEY_SERVER: &str = "key_";
const PREFIX_SERVER_ONLINE: &str = "ol_";

pub fn key_mid_server(mid: i64) -> String {
    format!("{PREFIX_MID_SERVER}{mid}")
}

pub fn key_key_server(key: &str) -> String {
    format!("{PREFIX_KEY_SERVER}{key}")
}

pub fn key_server_online(server: &str) -> String {
    format!("{PREFIX_SERVER_ONLINE}{server}")
}

impl Dao {
    /// 记录连接映射；`mid <= 0` 时只写 key 映射
    pub async fn add_mapping(&self, mid: i64, key: &str, server: &str) -> DaoResult<()> {
        let mut pipe = redis::pipe();
        if mid > 0 {
            let mid_key = key_mid_server(mid);
            pipe.hset(&mid_key, key, server)
                .ignore()
                .expire(&mid_key, self.redis_expire)
                .ignore();
        }
        let key_key = key_key_server(key);
        pipe.set(&key_key, server)
            .ignore()
            .expire(&key_key, self.redis_expire)
            .ignore();

        let mut conn = self.redis.acquire().await?;
        conn.query_pipe::<()>(CommandKind::Write, &pipe).await?;
        debug!(mid, key, server, "mapping added");
        Ok(())
    }

    /// 续期连接映射，任一映射仍存在时返回 true
    pub async fn expire_mapping(&self, mid: i64, key: &str) -> DaoResult<bool> {
        let mut pipe = redis::pipe();
        if mid > 0 {
            pipe.expire(key_mid_server(mid), self.redis_expire);
        }
        pipe.expire(key_key_server(key), self.redis_expire);

        let mut conn = self.redis.acquire().await?;
        let replies: Vec<bool> = conn.query_pipe(CommandKind::Write, &pipe).await?;
        Ok(replies.into_iter().any(|has| has))
    }

    /// 删除连接映射，任一映射被删除时返回 true
    pub async fn del_mapping(&self, mid: i64, key: &str, server: &str) -> DaoResult<bool> {
        let mut pipe = redis::pipe();
        if mid > 0 {
            pipe.hdel(key_mid_server(mid), key);
        }
        pipe.del(key_key_server(key));

        let mut conn = self.redis.acquire().await?;
        let replies: Vec<bool> = conn.query_pipe(CommandKind::Write, &pipe).await?;
        debug!(mid, key, server, "mapping deleted");
        Ok(replies.into_iter().any(|has| has))
    }

    /// 按连接 key 查询所在节点，顺序与 `keys` 一致，不存在的为空字符串
    pub async fn servers_by_keys(&self, keys: &[String]) -> DaoResult<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let cache_keys: Vec<String> = keys.iter().map(|key| key_key_server(key)).collect();

        let mut conn = self.redis.acquire().await?;
        let servers: Vec<Option<String>> = conn
            .query_cmd(CommandKind::Read, &redis::Cmd::mget(cache_keys))
            .await?;
        Ok(servers.into_iter().map(Option::unwrap_or_default).collect())
    }

    /// 按用户查询全部连接
    ///
    /// 返回连接 key -> 节点的映射，以及至少有一条连接的用户列表。
    pub async fn keys_by_mids(&self, mids: &[i64]) -> DaoResult<(HashMap<String, String>, Vec<i64>)> {
        if mids.is_empty() {
            return Ok((HashMap::new(), Vec::new()));
        }
        let mut pipe = redis::pipe();
        for mid in mids {
            pipe.hgetall(key_mid_server(*mid));
        }

        let mut conn = self.redis.acquire().await?;
        let replies: Vec<HashMap<String, String>> =
            conn.query_pipe(CommandKind::Read, &pipe).await?;
        drop(conn);

        let mut key_servers = HashMap::new();
        let mut online_mids = Vec::new();
        for (mid, entries) in mids.iter().zip(replies) {
            if !entries.is_empty() {
                online_mids.push(*mid);
            }
            key_servers.extend(entries);
        }
        Ok((key_servers, online_mids))
    }

    /// 写入节点在线快照
    pub async fn add_server_online(&self, server: &str, online: &Online) -> DaoResult<()> {
        let payload = serde_json::to_string(online)?;
        let cache_key = key_server_online(server);
        let mut pipe = redis::pipe();
        pipe.set(&cache_key, payload)
            .ignore()
            .expire(&cache_key, self.redis_expire)
            .ignore();

        let mut conn = self.redis.acquire().await?;
        conn.query_pipe::<()>(CommandKind::Write, &pipe).await
    }

    /// 读取节点在线快照，不存在时返回 None
    pub async fn server_online(&self, server: &str) -> DaoResult<Option<Online>> {
        let mut conn = self.redis.acquire().await?;
        let payload: Option<String> = conn
            .query_cmd(CommandKind::Read, &redis::Cmd::get(key_server_online(server)))
            .await?;
        drop(conn);

        payload
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(Into::into)
    }

    pub async fn del_server_online(&self, server: &str) -> DaoResult<()> {
        let mut conn = self.redis.acquire().await?;
        conn.query_cmd::<()>(CommandKind::Write, &redis::Cmd::del(key_server_online(server)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::tests::test_dao;
    use crate::error::DaoError;

    #[test]
    fn test_cache_key_layout() {
        assert_eq!(key_mid_server(123), "mid_123");
        assert_eq!(key_key_server("abc"), "key_abc");
        assert_eq!(key_server_online("comet-1"), "ol_comet-1");
    }

    #[tokio::test]
    async fn test_empty_lookups_do_not_touch_pool() {
        let (dao, _) = test_dao(false);
        dao.close().await.unwrap();

        assert!(dao.servers_by_keys(&[]).await.unwrap().is_empty());
        let (servers, mids) = dao.keys_by_mids(&[]).await.unwrap();
        assert!(servers.is_empty());
        assert!(mids.is_empty());
    }

    #[tokio::test]
    async fn test_accessors_fail_fast_after_close() {
        let (dao, _) = test_dao(false);
        dao.close().await.unwrap();

        assert!(matches!(
            dao.add_mapping(1, "k", "comet-1").await,
            Err(DaoError::PoolClosed)
        ));
        assert!(matches!(
            dao.server_online("comet-1").await,
            Err(DaoError::PoolClosed)
        ));
        assert!(matches!(
            dao.servers_by_keys(&["k".to_string()]).await,
            Err(DaoError::PoolClosed)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_redis_surfaces_connection_failure() {
        let (dao, _) = test_dao(false);
        let err = dao.del_server_online("comet-1").await.unwrap_err();
        assert!(err.is_connection_failure(), "unexpected error: {err}");
        assert_eq!(dao.pool_status().total, 0);
    }
}
