use anyhow::{anyhow, Result};
use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// GB28181 指令核心配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GbConfig {
    /// 平台 SIP ID
    pub sip_id: String,

    /// SIP 域
    pub sip_domain: String,

    /// 本地信令 IP（Via / Contact）
    pub local_ip: String,

    /// 本地信令端口
    pub local_port: u16,

    /// 等待设备响应的超时时间（秒）
    pub response_timeout_secs: u64,

    /// 流信息缓存键前缀
    pub stream_key_prefix: String,

    /// 对话信息缓存键前缀
    pub dialog_key_prefix: String,
}

impl Default for GbConfig {
    fn default() -> Self {
        Self {
            sip_id: "34020000002000000001".to_string(),
            sip_domain: "3402000000".to_string(),
            local_ip: "127.0.0.1".to_string(),
            local_port: 5060,
            response_timeout_secs: 5,
            stream_key_prefix: "stream_info".to_string(),
            dialog_key_prefix: "stream_transaction".to_string(),
        }
    }
}

impl GbConfig {
    /// 从 TOML 文件加载，文件不存在时返回默认配置
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let config = Config::builder()
            .add_source(File::new(
                path.to_str().ok_or_else(|| anyhow!("Invalid config path"))?,
                FileFormat::Toml,
            ))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}
