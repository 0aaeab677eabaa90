// 实时流会话
// 一次点播从 INVITE 成功到 BYE 之间的记录

use crate::sip::DialogIds;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 活跃的媒体流
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSession {
    /// 流 ID
    pub stream_id: String,

    pub device_id: String,

    pub channel_id: String,

    /// 媒体源地址（接收码流的媒体服务器 IP）
    pub media_ip: String,

    pub ssrc: String,

    /// 对话标识，BYE 时使用；同时作为对话记录丢失时的恢复依据
    pub dialog: DialogIds,

    pub created_at: DateTime<Utc>,
}

impl StreamSession {
    pub fn new(
        stream_id: String,
        device_id: String,
        channel_id: String,
        media_ip: String,
        ssrc: String,
        dialog: DialogIds,
    ) -> Self {
        Self {
            stream_id,
            device_id,
            channel_id,
            media_ip,
            ssrc,
            dialog,
            created_at: Utc::now(),
        }
    }
}

/// 按 (设备, 通道) 保存的对话记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogRecord {
    pub device_id: String,

    pub channel_id: String,

    /// 指回流信息记录
    pub stream_id: String,

    pub ssrc: String,

    pub dialog: DialogIds,
}

impl From<&StreamSession> for DialogRecord {
    fn from(session: &StreamSession) -> Self {
        Self {
            device_id: session.device_id.clone(),
            channel_id: session.channel_id.clone(),
            stream_id: session.stream_id.clone(),
            ssrc: session.ssrc.clone(),
            dialog: session.dialog.clone(),
        }
    }
}
