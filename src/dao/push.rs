use tracing::debug;

use super::Dao;
use crate::domain::model::PushMsg;
use crate::error::DaoResult;

impl Dao {
    /// 按连接 key 推送到指定 comet 节点，分区键为节点名
    pub async fn push_msg(
        &self,
        operation: i32,
        server: &str,
        keys: &[String],
        msg: &[u8],
    ) -> DaoResult<()> {
        self.publish_envelope(&PushMsg::push(operation, server, keys, msg))
            .await
    }

    /// 房间广播，分区键为房间号
    pub async fn broadcast_room_msg(&self, operation: i32, room: &str, msg: &[u8]) -> DaoResult<()> {
        self.publish_envelope(&PushMsg::room(operation, room, msg))
            .await
    }

    /// 全量广播，分区键为操作码
    pub async fn broadcast_msg(&self, operation: i32, speed: i32, msg: &[u8]) -> DaoResult<()> {
        self.publish_envelope(&PushMsg::broadcast(operation, speed, msg))
            .await
    }

    async fn publish_envelope(&self, envelope: &PushMsg) -> DaoResult<()> {
        let payload = envelope.encode()?;
        let key = envelope.partition_key();
        debug!(
            msg_type = ?envelope.msg_type,
            operation = envelope.operation,
            key = %key,
            "publishing push envelope"
        );
        self.publish_message(self.config.push_topic(), &self.ack_inbox, &key, &payload)
            .await
    }
}
