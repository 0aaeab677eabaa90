// GB28181 PTZ 前端控制指令
// 8 字节定长指令帧，A.3 前端设备控制协议

use crate::{GbError, Result};
use std::fmt;
use std::str::FromStr;

/// 字节 1：指令首字节
const SYNC_BYTE: u8 = 0xA5;

/// 字节 2：高 4 位版本号 0H，低 4 位校验位 (0xA + 0x5 + 0x0) % 16 = 0xF
const VERSION_CHECK_BYTE: u8 = 0x0F;

/// 字节 3：地址低 8 位
const ADDRESS_BYTE: u8 = 0x01;

const BIT_RIGHT: u8 = 0x01;
const BIT_LEFT: u8 = 0x02;
const BIT_DOWN: u8 = 0x04;
const BIT_UP: u8 = 0x08;
const BIT_ZOOM_IN: u8 = 0x10;
const BIT_ZOOM_OUT: u8 = 0x20;

/// 云台方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PtzDirection {
    Stop,
    Up,
    Down,
    Left,
    Right,
    UpLeft,
    UpRight,
    DownLeft,
    DownRight,
}

impl PtzDirection {
    pub const ALL: [PtzDirection; 9] = [
        PtzDirection::Stop,
        PtzDirection::Up,
        PtzDirection::Down,
        PtzDirection::Left,
        PtzDirection::Right,
        PtzDirection::UpLeft,
        PtzDirection::UpRight,
        PtzDirection::DownLeft,
        PtzDirection::DownRight,
    ];

    /// 方向对应的指令码位
    pub fn bits(self) -> u8 {
        match self {
            PtzDirection::Stop => 0,
            PtzDirection::Up => BIT_UP,
            PtzDirection::Down => BIT_DOWN,
            PtzDirection::Left => BIT_LEFT,
            PtzDirection::Right => BIT_RIGHT,
            PtzDirection::UpLeft => BIT_UP | BIT_LEFT,
            PtzDirection::UpRight => BIT_UP | BIT_RIGHT,
            PtzDirection::DownLeft => BIT_DOWN | BIT_LEFT,
            PtzDirection::DownRight => BIT_DOWN | BIT_RIGHT,
        }
    }
}

impl fmt::Display for PtzDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PtzDirection::Stop => "stop",
            PtzDirection::Up => "up",
            PtzDirection::Down => "down",
            PtzDirection::Left => "left",
            PtzDirection::Right => "right",
            PtzDirection::UpLeft => "upleft",
            PtzDirection::UpRight => "upright",
            PtzDirection::DownLeft => "downleft",
            PtzDirection::DownRight => "downright",
        };
        f.write_str(s)
    }
}

impl FromStr for PtzDirection {
    type Err = GbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stop" => Ok(PtzDirection::Stop),
            "up" => Ok(PtzDirection::Up),
            "down" => Ok(PtzDirection::Down),
            "left" => Ok(PtzDirection::Left),
            "right" => Ok(PtzDirection::Right),
            "upleft" => Ok(PtzDirection::UpLeft),
            "upright" => Ok(PtzDirection::UpRight),
            "downleft" => Ok(PtzDirection::DownLeft),
            "downright" => Ok(PtzDirection::DownRight),
            other => Err(GbError::InvalidCommand(format!("unknown direction: {}", other))),
        }
    }
}

/// 镜头变倍
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PtzZoom {
    #[default]
    None,
    In,
    Out,
}

impl PtzZoom {
    /// 由放大/缩小两个选择位构造，两者同时置位视为非法
    pub fn from_flags(zoom_in: bool, zoom_out: bool) -> Result<Self> {
        match (zoom_in, zoom_out) {
            (true, true) => Err(GbError::InvalidCommand(
                "zoom in and zoom out are mutually exclusive".to_string(),
            )),
            (true, false) => Ok(PtzZoom::In),
            (false, true) => Ok(PtzZoom::Out),
            (false, false) => Ok(PtzZoom::None),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            PtzZoom::None => 0,
            PtzZoom::In => BIT_ZOOM_IN,
            PtzZoom::Out => BIT_ZOOM_OUT,
        }
    }
}

/// 一次云台控制的语义描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtzCommand {
    pub direction: PtzDirection,
    pub zoom: PtzZoom,

    /// 水平速度（字节 5，原值写入）
    pub horizontal_speed: u8,

    /// 垂直速度（字节 6，原值写入）
    pub vertical_speed: u8,

    /// 变倍速度，仅高 4 位有效
    pub zoom_speed: u8,
}

impl PtzCommand {
    pub fn new(direction: PtzDirection) -> Self {
        Self {
            direction,
            zoom: PtzZoom::None,
            horizontal_speed: 0,
            vertical_speed: 0,
            zoom_speed: 0,
        }
    }

    pub fn with_zoom(mut self, zoom: PtzZoom) -> Self {
        self.zoom = zoom;
        self
    }

    pub fn with_speed(mut self, horizontal: u8, vertical: u8) -> Self {
        self.horizontal_speed = horizontal;
        self.vertical_speed = vertical;
        self
    }

    pub fn with_zoom_speed(mut self, zoom_speed: u8) -> Self {
        self.zoom_speed = zoom_speed;
        self
    }

    /// 从外部指令字符串解析（stop/up/.../zoomin/zoomout）
    ///
    /// 速度参数超出单字节范围时同样返回 `InvalidCommand`
    pub fn parse(token: &str, horizontal_speed: i64, vertical_speed: i64, combine_code: i64) -> Result<Self> {
        let (direction, zoom) = match token.to_ascii_lowercase().as_str() {
            "zoomin" => (PtzDirection::Stop, PtzZoom::In),
            "zoomout" => (PtzDirection::Stop, PtzZoom::Out),
            other => (other.parse::<PtzDirection>()?, PtzZoom::None),
        };

        Ok(Self {
            direction,
            zoom,
            horizontal_speed: speed_byte("horizontal speed", horizontal_speed)?,
            vertical_speed: speed_byte("vertical speed", vertical_speed)?,
            zoom_speed: speed_byte("zoom speed", combine_code)?,
        })
    }

    pub fn encode(&self) -> PtzFrame {
        let command = self.direction.bits() | self.zoom.bits();
        PtzFrame::from_fields(command, self.horizontal_speed, self.vertical_speed, self.zoom_speed)
    }
}

fn speed_byte(field: &str, value: i64) -> Result<u8> {
    u8::try_from(value)
        .map_err(|_| GbError::InvalidCommand(format!("{} out of range: {}", field, value)))
}

/// PTZ 指令帧
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtzFrame([u8; 8]);

impl PtzFrame {
    fn from_fields(command: u8, horizontal_speed: u8, vertical_speed: u8, zoom_speed: u8) -> Self {
        let mut bytes = [
            SYNC_BYTE,
            VERSION_CHECK_BYTE,
            ADDRESS_BYTE,
            command,
            horizontal_speed,
            vertical_speed,
            zoom_speed & 0xF0,
            0,
        ];
        bytes[7] = checksum(&bytes[..7]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn command(&self) -> u8 {
        self.0[3]
    }

    pub fn checksum(&self) -> u8 {
        self.0[7]
    }

    /// 16 位大写十六进制字符串（PTZCmd 字段内容）
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02X}", b)).collect()
    }
}

impl fmt::Display for PtzFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// 校验码 = (字节1 + ... + 字节7) % 256
fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// 生成 PTZ 指令帧
pub fn encode(
    direction: PtzDirection,
    zoom_in: bool,
    zoom_out: bool,
    horizontal_speed: u8,
    vertical_speed: u8,
    zoom_speed: u8,
) -> Result<PtzFrame> {
    let zoom = PtzZoom::from_flags(zoom_in, zoom_out)?;
    let frame = PtzCommand::new(direction)
        .with_zoom(zoom)
        .with_speed(horizontal_speed, vertical_speed)
        .with_zoom_speed(zoom_speed)
        .encode();

    tracing::debug!(target: "gb28181::ptz", %direction, ?zoom, frame = %frame, "PTZ frame encoded");

    Ok(frame)
}
