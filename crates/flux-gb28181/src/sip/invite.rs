// GB28181 实时点播 SDP
// INVITE 消息体的 SDP offer 生成

use std::fmt;

/// SDP 会话描述
#[derive(Debug, Clone)]
pub struct SdpSession {
    /// 版本
    pub version: u8,

    /// 会话源（o= 行用户名，使用通道 ID）
    pub origin: String,

    /// 会话名称（Play/Playback/Download）
    pub session_name: String,

    /// 连接地址（媒体服务器 IP）
    pub address: String,

    /// SSRC（GB28181 使用 y= 行携带，10 位十进制）
    pub ssrc: Option<String>,

    /// 媒体描述
    pub media: Vec<SdpMedia>,
}

/// SDP 媒体描述
#[derive(Debug, Clone)]
pub struct SdpMedia {
    /// 媒体类型（video/audio）
    pub media_type: String,

    /// 端口
    pub port: u16,

    /// 传输协议（RTP/AVP）
    pub protocol: String,

    /// RTP 映射
    pub rtpmap: Vec<RtpMap>,

    /// 属性
    pub attributes: Vec<String>,
}

/// RTP 映射
#[derive(Debug, Clone)]
pub struct RtpMap {
    /// 负载类型
    pub payload_type: u8,

    /// 编码名称（PS/H264/MPEG4）
    pub encoding_name: String,

    /// 时钟频率
    pub clock_rate: u32,
}

impl SdpSession {
    /// 创建实时点播 SDP
    pub fn play(origin: String, address: String) -> Self {
        Self {
            version: 0,
            origin,
            session_name: "Play".to_string(),
            address,
            ssrc: None,
            media: Vec::new(),
        }
    }

    pub fn with_ssrc(mut self, ssrc: impl Into<String>) -> Self {
        self.ssrc = Some(ssrc.into());
        self
    }

    /// 添加只收视频媒体（PS/H264/MPEG4）
    pub fn add_video(&mut self, port: u16) {
        let media = SdpMedia {
            media_type: "video".to_string(),
            port,
            protocol: "RTP/AVP".to_string(),
            rtpmap: vec![
                RtpMap {
                    payload_type: 96,
                    encoding_name: "PS".to_string(),
                    clock_rate: 90000,
                },
                RtpMap {
                    payload_type: 98,
                    encoding_name: "H264".to_string(),
                    clock_rate: 90000,
                },
                RtpMap {
                    payload_type: 97,
                    encoding_name: "MPEG4".to_string(),
                    clock_rate: 90000,
                },
            ],
            attributes: vec!["recvonly".to_string()],
        };

        self.media.push(media);
    }
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v={}\r\n", self.version)?;
        write!(f, "o={} 0 0 IN IP4 {}\r\n", self.origin, self.address)?;
        write!(f, "s={}\r\n", self.session_name)?;
        write!(f, "c=IN IP4 {}\r\n", self.address)?;
        write!(f, "t=0 0\r\n")?;

        for media in &self.media {
            let formats: Vec<String> = media.rtpmap.iter().map(|m| m.payload_type.to_string()).collect();
            write!(
                f,
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                formats.join(" ")
            )?;

            for attr in &media.attributes {
                write!(f, "a={}\r\n", attr)?;
            }

            for rtpmap in &media.rtpmap {
                write!(
                    f,
                    "a=rtpmap:{} {}/{}\r\n",
                    rtpmap.payload_type, rtpmap.encoding_name, rtpmap.clock_rate
                )?;
            }
        }

        // y= SSRC (GB28181)
        if let Some(ssrc) = &self.ssrc {
            write!(f, "y={}\r\n", ssrc)?;
        }

        Ok(())
    }
}
