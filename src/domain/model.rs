use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::DaoResult;
use crate::utils::current_seconds;

/// 推送消息类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushMsgType {
    /// 按连接 key 推送到指定 comet 节点
    Push,
    /// 房间广播
    Room,
    /// 全量广播
    Broadcast,
}

/// 发往下游投递节点的推送信封
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMsg {
    #[serde(rename = "type")]
    pub msg_type: PushMsgType,
    pub operation: i32,
    #[serde(default)]
    pub speed: i32,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub msg: Vec<u8>,
}

impl PushMsg {
    pub fn push(operation: i32, server: &str, keys: &[String], msg: &[u8]) -> Self {
        Self {
            msg_type: PushMsgType::Push,
            operation,
            speed: 0,
            server: server.to_string(),
            room: String::new(),
            keys: keys.to_vec(),
            msg: msg.to_vec(),
        }
    }

    pub fn room(operation: i32, room: &str, msg: &[u8]) -> Self {
        Self {
            msg_type: PushMsgType::Room,
            operation,
            speed: 0,
            server: String::new(),
            room: room.to_string(),
            keys: Vec::new(),
            msg: msg.to_vec(),
        }
    }

    pub fn broadcast(operation: i32, speed: i32, msg: &[u8]) -> Self {
        Self {
            msg_type: PushMsgType::Broadcast,
            operation,
            speed,
            server: String::new(),
            room: String::new(),
            keys: Vec::new(),
            msg: msg.to_vec(),
        }
    }

    /// 分区键：单推按 comet 节点，房间按房间号，广播按操作码
    pub fn partition_key(&self) -> String {
        match self.msg_type {
            PushMsgType::Push => self.server.clone(),
            PushMsgType::Room => self.room.clone(),
            PushMsgType::Broadcast => self.operation.to_string(),
        }
    }

    pub fn encode(&self) -> DaoResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> DaoResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// comet 节点在线快照
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Online {
    pub server: String,
    /// 房间号 -> 在线人数
    #[serde(default)]
    pub room_count: HashMap<String, i32>,
    /// 更新时间（秒）
    pub updated: i64,
}

impl Online {
    /// 以当前时间作为更新时间
    pub fn new(server: impl Into<String>, room_count: HashMap<String, i32>) -> Self {
        Self {
            server: server.into(),
            room_count,
            updated: current_seconds(),
        }
    }

    /// 全部房间的在线人数之和
    pub fn total(&self) -> i64 {
        self.room_count.values().map(|count| i64::from(*count)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_keys() {
        let keys = vec!["k1".to_string(), "k2".to_string()];
        assert_eq!(PushMsg::push(9, "comet-1", &keys, b"hi").partition_key(), "comet-1");
        assert_eq!(PushMsg::room(5, "live://1000", b"hi").partition_key(), "live://1000");
        assert_eq!(PushMsg::broadcast(7, 10, b"hi").partition_key(), "7");
    }

    #[test]
    fn test_envelope_wire_format() {
        let msg = PushMsg::room(5, "live://1000", b"hi");
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "room");
        assert_eq!(value["operation"], 5);
        assert_eq!(value["room"], "live://1000");

        let decoded = PushMsg::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_online_snapshot() {
        let rooms = HashMap::from([("live://1".to_string(), 3), ("live://2".to_string(), 4)]);
        let online = Online::new("comet-1", rooms);
        assert_eq!(online.total(), 7);
        assert!(online.updated > 0);

        let json = serde_json::to_string(&online).unwrap();
        let decoded: Online = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, online);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(PushMsg::decode(b"not json").is_err());
    }
}
