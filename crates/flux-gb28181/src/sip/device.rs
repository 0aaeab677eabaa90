// GB28181 设备
// 设备信令地址、媒体服务器描述与设备注册表

use crate::{GbError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// 已注册的 GB28181 设备
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// 设备 ID（20位国标编码）
    pub device_id: String,

    pub ip: String,

    pub port: u16,

    /// 信令传输协议（UDP/TCP）
    pub transport: String,
}

impl Device {
    pub fn new(device_id: String, ip: String, port: u16) -> Self {
        Self {
            device_id,
            ip,
            port,
            transport: "UDP".to_string(),
        }
    }

    /// 信令地址
    pub fn address(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.ip, self.port)
            .parse()
            .map_err(|e| GbError::InvalidAddress(format!("{}:{} ({})", self.ip, self.port, e)))
    }
}

/// 接收码流的媒体服务器
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDetail {
    pub id: String,

    /// SDP c= 行地址
    pub ip: String,
}

impl MediaDetail {
    pub fn new(id: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ip: ip.into(),
        }
    }
}

/// 设备注册表
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn get_device_by_id(&self, device_id: &str) -> Option<Device>;
}

/// 内存设备注册表
#[derive(Default)]
pub struct DeviceManager {
    devices: DashMap<String, Device>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册设备，已存在时覆盖地址
    pub async fn register_device(&self, device: Device) {
        tracing::info!(target: "gb28181::sip", device_id = %device.device_id, "Device registered");
        self.devices.insert(device.device_id.clone(), device);
    }

    pub async fn unregister_device(&self, device_id: &str) -> Option<Device> {
        let removed = self.devices.remove(device_id).map(|(_, device)| device);
        if removed.is_some() {
            tracing::info!(target: "gb28181::sip", %device_id, "Device unregistered");
        }
        removed
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

#[async_trait]
impl DeviceRegistry for DeviceManager {
    async fn get_device_by_id(&self, device_id: &str) -> Option<Device> {
        self.devices.get(device_id).map(|entry| entry.value().clone())
    }
}
