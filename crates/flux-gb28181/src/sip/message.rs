// SIP 消息解析和生成
// 支持 GB28181 标准的 SIP 消息格式

use crate::{GbError, Result};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

/// SIP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Message,
    Subscribe,
    Notify,
    Info,
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMethod::Register => write!(f, "REGISTER"),
            SipMethod::Invite => write!(f, "INVITE"),
            SipMethod::Ack => write!(f, "ACK"),
            SipMethod::Bye => write!(f, "BYE"),
            SipMethod::Cancel => write!(f, "CANCEL"),
            SipMethod::Message => write!(f, "MESSAGE"),
            SipMethod::Subscribe => write!(f, "SUBSCRIBE"),
            SipMethod::Notify => write!(f, "NOTIFY"),
            SipMethod::Info => write!(f, "INFO"),
        }
    }
}

impl SipMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "BYE" => Some(SipMethod::Bye),
            "CANCEL" => Some(SipMethod::Cancel),
            "MESSAGE" => Some(SipMethod::Message),
            "SUBSCRIBE" => Some(SipMethod::Subscribe),
            "NOTIFY" => Some(SipMethod::Notify),
            "INFO" => Some(SipMethod::Info),
            _ => None,
        }
    }
}

/// 头部紧凑形式（RFC 3261 7.3.3）
fn compact_name(name: &str) -> Option<&'static str> {
    match name.to_ascii_lowercase().as_str() {
        "call-id" => Some("i"),
        "from" => Some("f"),
        "to" => Some("t"),
        "via" => Some("v"),
        "contact" => Some("m"),
        "content-type" => Some("c"),
        "content-length" => Some("l"),
        _ => None,
    }
}

/// 取头部参数，例如 `<sip:a@b>;tag=123` 中的 tag
///
/// 尖括号内的 URI 参数不参与匹配
pub fn header_param(value: &str, name: &str) -> Option<String> {
    let params = match value.rfind('>') {
        Some(pos) => &value[pos + 1..],
        None => value,
    };

    params.split(';').skip(1).find_map(|part| {
        let (key, val) = match part.find('=') {
            Some(pos) => (&part[..pos], &part[pos + 1..]),
            None => (part, ""),
        };
        if key.trim().eq_ignore_ascii_case(name) && !val.trim().is_empty() {
            Some(val.trim().to_string())
        } else {
            None
        }
    })
}

/// 对话相关头部的读取接口
pub trait SipHeaders {
    fn headers(&self) -> &HashMap<String, String>;

    /// 按名称读取头部（大小写不敏感，兼容紧凑形式，完整名称优先）
    fn header(&self, name: &str) -> Option<&str> {
        let find = |wanted: &str| {
            self.headers()
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(wanted))
                .map(|(_, value)| value.as_str())
        };

        find(name).or_else(|| compact_name(name).and_then(find))
    }

    fn call_id(&self) -> Option<&str> {
        self.header("Call-ID").map(str::trim).filter(|v| !v.is_empty())
    }

    fn from_tag(&self) -> Option<String> {
        self.header("From").and_then(|v| header_param(v, "tag"))
    }

    fn to_tag(&self) -> Option<String> {
        self.header("To").and_then(|v| header_param(v, "tag"))
    }

    /// 最顶层 Via 的 branch
    fn via_branch(&self) -> Option<String> {
        let via = self.header("Via")?;
        let top = via.split(',').next()?;
        header_param(top, "branch")
    }

    /// CSeq 序号
    fn cseq(&self) -> Option<u32> {
        self.header("CSeq")?.split_whitespace().next()?.parse().ok()
    }

    /// CSeq 中的方法
    fn cseq_method(&self) -> Option<SipMethod> {
        self.header("CSeq")?.split_whitespace().nth(1).and_then(SipMethod::parse)
    }
}

/// SIP 请求
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,

    /// 发送目标地址（不参与序列化）
    pub destination: Option<SocketAddr>,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: String) -> Self {
        Self {
            method,
            uri,
            version: "SIP/2.0".to_string(),
            headers: HashMap::new(),
            body: None,
            destination: None,
        }
    }

    /// 添加头部
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    /// 设置消息体
    pub fn set_body(&mut self, body: String) {
        self.body = Some(body);
    }

    pub fn set_destination(&mut self, addr: SocketAddr) {
        self.destination = Some(addr);
    }

    /// 从字符串解析 SIP 请求
    pub fn parse(s: &str) -> Result<Self> {
        let (first_line, headers, body) = split_message(s)?;

        let request_line: Vec<&str> = first_line.split_whitespace().collect();
        if request_line.len() != 3 {
            return Err(GbError::Parse("Invalid request line".to_string()));
        }

        let method = SipMethod::parse(request_line[0])
            .ok_or_else(|| GbError::Parse(format!("Unknown method: {}", request_line[0])))?;

        Ok(Self {
            method,
            uri: request_line[1].to_string(),
            version: request_line[2].to_string(),
            headers,
            body,
            destination: None,
        })
    }
}

impl SipHeaders for SipRequest {
    fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.method, self.uri, self.version)?;
        write_headers_and_body(f, &self.headers, self.body.as_deref())
    }
}

/// SIP 响应
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl SipResponse {
    pub fn new(status_code: u16, reason_phrase: String) -> Self {
        Self {
            version: "SIP/2.0".to_string(),
            status_code,
            reason_phrase,
            headers: HashMap::new(),
            body: None,
        }
    }

    /// 添加头部
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    /// 设置消息体
    pub fn set_body(&mut self, body: String) {
        self.body = Some(body);
    }

    /// 1xx 临时响应
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code)
    }

    /// 2xx 成功响应
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// 从字符串解析 SIP 响应
    pub fn parse(s: &str) -> Result<Self> {
        let (first_line, headers, body) = split_message(s)?;

        let status_line: Vec<&str> = first_line.splitn(3, ' ').collect();
        if status_line.len() != 3 {
            return Err(GbError::Parse("Invalid status line".to_string()));
        }

        let status_code = status_line[1]
            .parse::<u16>()
            .map_err(|_| GbError::Parse("Invalid status code".to_string()))?;

        Ok(Self {
            version: status_line[0].to_string(),
            status_code,
            reason_phrase: status_line[2].to_string(),
            headers,
            body,
        })
    }
}

impl SipHeaders for SipResponse {
    fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.version, self.status_code, self.reason_phrase)?;
        write_headers_and_body(f, &self.headers, self.body.as_deref())
    }
}

/// SIP 消息（请求或响应）
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    /// 从字符串解析 SIP 消息
    pub fn parse(s: &str) -> Result<Self> {
        if s.starts_with("SIP/") {
            Ok(SipMessage::Response(SipResponse::parse(s)?))
        } else {
            Ok(SipMessage::Request(SipRequest::parse(s)?))
        }
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMessage::Request(req) => fmt::Display::fmt(req, f),
            SipMessage::Response(resp) => fmt::Display::fmt(resp, f),
        }
    }
}

fn write_headers_and_body(
    f: &mut fmt::Formatter<'_>,
    headers: &HashMap<String, String>,
    body: Option<&str>,
) -> fmt::Result {
    for (key, value) in headers {
        // Content-Length 按实际消息体重新计算
        if key.eq_ignore_ascii_case("Content-Length") || key == "l" {
            continue;
        }
        write!(f, "{}: {}\r\n", key, value)?;
    }

    match body {
        Some(body) => write!(f, "Content-Length: {}\r\n\r\n{}", body.len(), body),
        None => write!(f, "Content-Length: 0\r\n\r\n"),
    }
}

/// 拆分起始行、头部和消息体
fn split_message(s: &str) -> Result<(&str, HashMap<String, String>, Option<String>)> {
    let (head, body) = match s.find("\r\n\r\n") {
        Some(pos) => (&s[..pos], &s[pos + 4..]),
        None => (s.trim_end_matches("\r\n"), ""),
    };

    let mut lines = head.split("\r\n");
    let first_line = lines
        .next()
        .filter(|l| !l.trim().is_empty())
        .ok_or_else(|| GbError::Parse("Empty SIP message".to_string()))?;

    // 同名头部只保留第一次出现的值（最顶层 Via）
    let mut headers = HashMap::new();
    for line in lines {
        if let Some(pos) = line.find(':') {
            let key = line[..pos].trim().to_string();
            let value = line[pos + 1..].trim().to_string();
            headers.entry(key).or_insert(value);
        }
    }

    let body = if body.is_empty() { None } else { Some(body.to_string()) };

    Ok((first_line, headers, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sip_request_generation() {
        let mut req = SipRequest::new(
            SipMethod::Invite,
            "sip:34020000001320000001@192.168.1.100:5060".to_string(),
        );

        req.add_header("Via", "SIP/2.0/UDP 192.168.1.10:5060;branch=z9hG4bK1234");
        req.add_header("Call-ID", "123456789@192.168.1.100");
        req.add_header("CSeq", "1 INVITE");
        req.set_body("v=0\r\n".to_string());

        let sip_str = req.to_string();

        assert!(sip_str.starts_with("INVITE sip:34020000001320000001@192.168.1.100:5060 SIP/2.0\r\n"));
        assert!(sip_str.contains("Via:"));
        assert!(sip_str.contains("Content-Length: 5\r\n\r\nv=0\r\n"));
    }

    #[test]
    fn test_sip_response_parsing() {
        let sip_str = "SIP/2.0 200 OK\r\n\
                       Via: SIP/2.0/UDP 192.168.1.10:5060;branch=z9hG4bK776asdhds;rport\r\n\
                       From: <sip:34020000002000000001@3402000000>;tag=1928301774\r\n\
                       To: <sip:34020000001320000001@3402000000>;tag=a6c85cf\r\n\
                       Call-ID: a84b4c76e66710@192.168.1.10\r\n\
                       CSeq: 20 INVITE\r\n\
                       Content-Length: 0\r\n\
                       \r\n";

        let resp = SipResponse::parse(sip_str).unwrap();

        assert_eq!(resp.status_code, 200);
        assert!(resp.is_success());
        assert_eq!(resp.call_id(), Some("a84b4c76e66710@192.168.1.10"));
        assert_eq!(resp.from_tag().as_deref(), Some("1928301774"));
        assert_eq!(resp.to_tag().as_deref(), Some("a6c85cf"));
        assert_eq!(resp.via_branch().as_deref(), Some("z9hG4bK776asdhds"));
        assert_eq!(resp.cseq(), Some(20));
        assert!(resp.body.is_none());
    }

    #[test]
    fn test_compact_and_case_insensitive_headers() {
        let sip_str = "BYE sip:34020000001320000001@192.168.1.100:5060 SIP/2.0\r\n\
                       v: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKtop, SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKlow\r\n\
                       f: <sip:a@b>;tag=ft\r\n\
                       call-id: xyz\r\n\
                       \r\n";

        let req = SipRequest::parse(sip_str).unwrap();

        assert_eq!(req.method, SipMethod::Bye);
        assert_eq!(req.call_id(), Some("xyz"));
        assert_eq!(req.from_tag().as_deref(), Some("ft"));
        assert_eq!(req.via_branch().as_deref(), Some("z9hG4bKtop"));
        assert!(req.to_tag().is_none());
    }

    #[test]
    fn test_header_param_ignores_uri_params() {
        assert_eq!(header_param("<sip:a@b;tag=inner>", "tag"), None);
        assert_eq!(header_param("<sip:a@b;transport=udp>;tag=outer", "tag").as_deref(), Some("outer"));
        assert_eq!(header_param("<sip:a@b>;tag=", "tag"), None);
    }

    #[test]
    fn test_message_dispatch() {
        let msg = SipMessage::parse("SIP/2.0 100 Trying\r\nContent-Length: 0\r\n\r\n").unwrap();
        match msg {
            SipMessage::Response(resp) => assert!(resp.is_provisional()),
            SipMessage::Request(_) => panic!("expected response"),
        }

        assert!(SipMessage::parse("").is_err());
    }

    #[test]
    fn test_repeated_headers_keep_first() {
        let sip_str = "SIP/2.0 200 OK\r\n\
                       Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKtop\r\n\
                       Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKlow\r\n\
                       Call-ID: long-form\r\n\
                       i: compact-form\r\n\
                       CSeq: 4 BYE\r\n\
                       \r\n";

        let resp = SipResponse::parse(sip_str).unwrap();

        assert_eq!(resp.via_branch().as_deref(), Some("z9hG4bKtop"));
        assert_eq!(resp.call_id(), Some("long-form"));
        assert_eq!(resp.cseq_method(), Some(SipMethod::Bye));
    }
}
