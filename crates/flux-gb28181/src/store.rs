// 会话存储
// 流信息与对话信息的持久化，键格式：
//   <stream_prefix>:<stream_id>
//   <dialog_prefix>:<device_id>:<channel_id>

use crate::cache::Cache;
use crate::config::GbConfig;
use crate::session::{DialogRecord, StreamSession};
use crate::sip::DialogIds;
use crate::{GbError, Result};
use std::sync::Arc;

pub struct SessionStore {
    cache: Arc<dyn Cache>,
    stream_prefix: String,
    dialog_prefix: String,
}

impl SessionStore {
    pub fn new(cache: Arc<dyn Cache>, stream_prefix: impl Into<String>, dialog_prefix: impl Into<String>) -> Self {
        Self {
            cache,
            stream_prefix: stream_prefix.into(),
            dialog_prefix: dialog_prefix.into(),
        }
    }

    pub fn from_config(cache: Arc<dyn Cache>, config: &GbConfig) -> Self {
        Self::new(cache, config.stream_key_prefix.clone(), config.dialog_key_prefix.clone())
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub fn stream_key(&self, stream_id: &str) -> String {
        format!("{}:{}", self.stream_prefix, stream_id)
    }

    pub fn dialog_key(&self, device_id: &str, channel_id: &str) -> String {
        format!("{}:{}:{}", self.dialog_prefix, device_id, channel_id)
    }

    /// 保存流信息（覆盖写）
    pub async fn save_stream(&self, session: &StreamSession) -> Result<()> {
        let value = serde_json::to_string(session)?;
        self.cache.set(&self.stream_key(&session.stream_id), value).await?;

        tracing::debug!(stream_id = %session.stream_id, "Stream info saved");
        Ok(())
    }

    pub async fn get_stream(&self, stream_id: &str) -> Result<StreamSession> {
        match self.cache.get(&self.stream_key(stream_id)).await? {
            Some(value) => Ok(serde_json::from_str(&value)?),
            None => Err(GbError::SessionNotFound(format!("stream {}", stream_id))),
        }
    }

    /// 保存对话信息（覆盖写）
    pub async fn save_dialog(
        &self,
        device_id: &str,
        channel_id: &str,
        stream_id: &str,
        ssrc: &str,
        dialog: &DialogIds,
    ) -> Result<()> {
        let record = DialogRecord {
            device_id: device_id.to_string(),
            channel_id: channel_id.to_string(),
            stream_id: stream_id.to_string(),
            ssrc: ssrc.to_string(),
            dialog: dialog.clone(),
        };
        self.put_dialog(&record).await
    }

    async fn put_dialog(&self, record: &DialogRecord) -> Result<()> {
        let value = serde_json::to_string(record)?;
        self.cache
            .set(&self.dialog_key(&record.device_id, &record.channel_id), value)
            .await?;

        tracing::debug!(
            device_id = %record.device_id,
            channel_id = %record.channel_id,
            call_id = %record.dialog.call_id,
            "Dialog info saved"
        );
        Ok(())
    }

    pub async fn get_dialog(&self, device_id: &str, channel_id: &str) -> Result<DialogRecord> {
        match self.cache.get(&self.dialog_key(device_id, channel_id)).await? {
            Some(value) => Ok(serde_json::from_str(&value)?),
            None => Err(GbError::SessionNotFound(format!("{}/{}", device_id, channel_id))),
        }
    }

    /// 删除流信息，键不存在同样视为成功
    pub async fn delete_stream(&self, stream_id: &str) -> Result<()> {
        if !self.cache.del(&self.stream_key(stream_id)).await? {
            tracing::debug!(%stream_id, "Stream info already absent");
        }
        Ok(())
    }

    /// 删除对话信息，键不存在同样视为成功
    pub async fn delete_dialog(&self, device_id: &str, channel_id: &str) -> Result<()> {
        if !self.cache.del(&self.dialog_key(device_id, channel_id)).await? {
            tracing::debug!(%device_id, %channel_id, "Dialog info already absent");
        }
        Ok(())
    }

    /// 由流信息补写缺失的对话记录
    ///
    /// 流信息先于对话信息写入，两次写之间中断时对话记录缺失，重启后可据此修复。
    /// 已存在的对话记录不会被覆盖，返回 `false`。
    pub async fn restore_dialog(&self, stream_id: &str) -> Result<bool> {
        let session = self.get_stream(stream_id).await?;

        if self
            .cache
            .get(&self.dialog_key(&session.device_id, &session.channel_id))
            .await?
            .is_some()
        {
            return Ok(false);
        }

        self.put_dialog(&DialogRecord::from(&session)).await?;
        tracing::info!(
            %stream_id,
            device_id = %session.device_id,
            channel_id = %session.channel_id,
            "Dialog info restored from stream info"
        );
        Ok(true)
    }
}
