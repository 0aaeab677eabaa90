// SIP 请求构造
// MESSAGE / INVITE / ACK / BYE

use super::device::{Device, MediaDetail};
use super::invite::SdpSession;
use super::message::{SipHeaders, SipMethod, SipRequest, SipResponse};
use crate::config::GbConfig;
use crate::manscdp;
use crate::session::DialogRecord;
use crate::Result;
use rand::Rng;

/// RFC 3261 branch 魔术前缀
const BRANCH_MAGIC: &str = "z9hG4bK";

const MAX_FORWARDS: &str = "70";

pub struct RequestFactory {
    sip_id: String,
    sip_domain: String,
    local_ip: String,
    local_port: u16,
}

impl RequestFactory {
    pub fn new(config: &GbConfig) -> Self {
        Self {
            sip_id: config.sip_id.clone(),
            sip_domain: config.sip_domain.clone(),
            local_ip: config.local_ip.clone(),
            local_port: config.local_port,
        }
    }

    fn via(&self, branch: &str) -> String {
        format!("SIP/2.0/UDP {}:{};rport;branch={}", self.local_ip, self.local_port, branch)
    }

    fn from_header(&self, tag: &str) -> String {
        format!("<sip:{}@{}>;tag={}", self.sip_id, self.sip_domain, tag)
    }

    fn contact(&self) -> String {
        format!("<sip:{}@{}:{}>", self.sip_id, self.local_ip, self.local_port)
    }

    fn new_call_id(&self) -> String {
        format!("{:016x}@{}", rand::thread_rng().gen::<u64>(), self.local_ip)
    }

    /// 携带 MANSCDP 消息体的 MESSAGE 请求
    pub fn message(&self, device: &Device, body: String, seq: i64) -> Result<SipRequest> {
        let mut request = SipRequest::new(
            SipMethod::Message,
            format!("sip:{}@{}:{}", device.device_id, device.ip, device.port),
        );

        request.add_header("Via", self.via(&new_branch()));
        request.add_header("From", self.from_header(&new_tag()));
        request.add_header("To", format!("<sip:{}@{}>", device.device_id, self.sip_domain));
        request.add_header("Call-ID", self.new_call_id());
        request.add_header("CSeq", format!("{} MESSAGE", seq));
        request.add_header("Max-Forwards", MAX_FORWARDS);
        request.add_header("Content-Type", manscdp::CONTENT_TYPE);
        request.set_body(body);
        request.set_destination(device.address()?);

        Ok(request)
    }

    /// 实时点播 INVITE
    pub fn invite(
        &self,
        device: &Device,
        media: &MediaDetail,
        channel_id: &str,
        ssrc: &str,
        rtp_port: u16,
        seq: i64,
    ) -> Result<SipRequest> {
        let mut sdp = SdpSession::play(channel_id.to_string(), media.ip.clone()).with_ssrc(ssrc);
        sdp.add_video(rtp_port);

        let mut request = SipRequest::new(
            SipMethod::Invite,
            format!("sip:{}@{}:{}", channel_id, device.ip, device.port),
        );

        request.add_header("Via", self.via(&new_branch()));
        request.add_header("From", self.from_header(&new_tag()));
        request.add_header("To", format!("<sip:{}@{}>", channel_id, self.sip_domain));
        request.add_header("Call-ID", self.new_call_id());
        request.add_header("CSeq", format!("{} INVITE", seq));
        request.add_header("Contact", self.contact());
        request.add_header("Max-Forwards", MAX_FORWARDS);
        request.add_header("Subject", format!("{}:{},{}:0", channel_id, ssrc, self.sip_id));
        request.add_header("Content-Type", "application/sdp");
        request.set_body(sdp.to_string());
        request.set_destination(device.address()?);

        Ok(request)
    }

    /// 2xx 响应的 ACK
    ///
    /// 请求 URI 取响应 Contact（远端目标），没有时沿用 INVITE 的 URI
    pub fn ack(&self, invite: &SipRequest, response: &SipResponse) -> SipRequest {
        let uri = response
            .header("Contact")
            .and_then(contact_uri)
            .unwrap_or_else(|| invite.uri.clone());

        let mut request = SipRequest::new(SipMethod::Ack, uri);

        request.add_header("Via", self.via(&new_branch()));
        for name in ["From", "Call-ID"] {
            if let Some(value) = invite.header(name) {
                request.add_header(name, value);
            }
        }
        if let Some(to) = response.header("To") {
            request.add_header("To", to);
        }
        request.add_header("CSeq", format!("{} ACK", invite.cseq().unwrap_or(1)));
        request.add_header("Contact", self.contact());
        request.add_header("Max-Forwards", MAX_FORWARDS);
        request.destination = invite.destination;

        request
    }

    /// 结束已建立对话的 BYE，沿用保存的 Call-ID、tag 与 branch
    pub fn bye(&self, device: &Device, channel_id: &str, record: &DialogRecord, seq: i64) -> Result<SipRequest> {
        let mut request = SipRequest::new(
            SipMethod::Bye,
            format!("sip:{}@{}:{}", channel_id, device.ip, device.port),
        );

        request.add_header("Via", self.via(&record.dialog.branch));
        request.add_header("From", self.from_header(&record.dialog.from_tag));
        request.add_header(
            "To",
            format!("<sip:{}@{}>;tag={}", channel_id, self.sip_domain, record.dialog.to_tag),
        );
        request.add_header("Call-ID", record.dialog.call_id.clone());
        request.add_header("CSeq", format!("{} BYE", seq));
        request.add_header("Max-Forwards", MAX_FORWARDS);
        request.set_destination(device.address()?);

        Ok(request)
    }
}

fn new_tag() -> String {
    rand::thread_rng().gen_range(100_000_000u32..1_000_000_000).to_string()
}

fn new_branch() -> String {
    format!("{}{:x}", BRANCH_MAGIC, rand::thread_rng().gen::<u64>())
}

/// `<sip:xxx@host:port>;expires=...` 中的 URI
fn contact_uri(contact: &str) -> Option<String> {
    let start = contact.find('<')?;
    let end = contact[start..].find('>')? + start;
    let uri = contact[start + 1..end].trim();
    if uri.is_empty() {
        None
    } else {
        Some(uri.to_string())
    }
}
