// MANSCDP 消息体
// GB28181 查询/控制 XML（Application/MANSCDP+xml）

use crate::ptz::PtzFrame;
use crate::{GbError, Result};
use serde::{Deserialize, Serialize};

pub const CONTENT_TYPE: &str = "Application/MANSCDP+xml";

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="GB2312"?>"#;

/// 默认控制优先级
const CONTROL_PRIORITY: u8 = 5;

pub const CMD_DEVICE_INFO: &str = "DeviceInfo";
pub const CMD_CATALOG: &str = "Catalog";
pub const CMD_DEVICE_CONTROL: &str = "DeviceControl";

/// 查询请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "Query")]
pub struct Query {
    #[serde(rename = "CmdType")]
    pub cmd_type: String,

    #[serde(rename = "SN")]
    pub sn: i64,

    #[serde(rename = "DeviceID")]
    pub device_id: String,
}

/// 设备控制请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "Control")]
pub struct Control {
    #[serde(rename = "CmdType")]
    pub cmd_type: String,

    #[serde(rename = "SN")]
    pub sn: i64,

    /// 被控通道 ID
    #[serde(rename = "DeviceID")]
    pub device_id: String,

    #[serde(rename = "PTZCmd")]
    pub ptz_cmd: String,

    #[serde(rename = "Info")]
    pub info: ControlInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlInfo {
    #[serde(rename = "ControlPriority")]
    pub control_priority: u8,
}

fn to_document<T: Serialize>(value: &T) -> Result<String> {
    let body = quick_xml::se::to_string(value).map_err(|e| GbError::Document(e.to_string()))?;
    Ok(format!("{}\r\n{}\r\n", XML_DECLARATION, body))
}

/// 设备信息查询
pub fn device_info_query(sn: i64, device_id: &str) -> Result<String> {
    to_document(&Query {
        cmd_type: CMD_DEVICE_INFO.to_string(),
        sn,
        device_id: device_id.to_string(),
    })
}

/// 设备目录查询
pub fn catalog_query(sn: i64, device_id: &str) -> Result<String> {
    to_document(&Query {
        cmd_type: CMD_CATALOG.to_string(),
        sn,
        device_id: device_id.to_string(),
    })
}

/// 云台控制
pub fn ptz_control(sn: i64, channel_id: &str, frame: &PtzFrame) -> Result<String> {
    to_document(&Control {
        cmd_type: CMD_DEVICE_CONTROL.to_string(),
        sn,
        device_id: channel_id.to_string(),
        ptz_cmd: frame.to_hex(),
        info: ControlInfo {
            control_priority: CONTROL_PRIORITY,
        },
    })
}
