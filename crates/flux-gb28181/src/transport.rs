// SIP 传输
// 发送请求并按 Via branch 匹配最终响应

use crate::sip::{SipHeaders, SipMessage, SipMethod, SipRequest, SipResponse};
use crate::{GbError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;

/// 客户端事务句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionHandle {
    pub branch: String,
    pub method: SipMethod,
}

/// 信令传输 trait
#[async_trait]
pub trait SipTransport: Send + Sync {
    /// 发送请求并开启客户端事务
    async fn send_request(&self, request: &SipRequest) -> Result<TransactionHandle>;

    /// 等待事务的最终响应（跳过 1xx）
    async fn await_response(&self, handle: &TransactionHandle) -> Result<SipResponse>;

    /// 发送无需响应的请求（ACK）
    async fn send(&self, request: &SipRequest) -> Result<()>;
}

/// UDP 传输
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    timeout: Duration,
    /// branch -> (请求方法, 响应通道)
    pending: DashMap<String, (SipMethod, oneshot::Sender<SipResponse>)>,
    waiting: DashMap<String, oneshot::Receiver<SipResponse>>,
}

impl UdpTransport {
    pub async fn bind(bind_addr: &str, timeout: Duration) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| GbError::transport(format!("Failed to bind UDP socket: {}", e)))?;

        tracing::info!(target: "gb28181::sip", "SIP transport listening on {}", bind_addr);

        Ok(Self {
            socket: Arc::new(socket),
            timeout,
            pending: DashMap::new(),
            waiting: DashMap::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// 接收循环
    pub async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, addr)) => {
                    let data = String::from_utf8_lossy(&buf[..len]).to_string();
                    if let Err(e) = self.handle_datagram(&data, addr) {
                        tracing::warn!(target: "gb28181::sip", "Dropped datagram from {}: {}", addr, e);
                    }
                }
                Err(e) => {
                    tracing::error!(target: "gb28181::sip", "Failed to receive UDP packet: {}", e);
                }
            }
        }
    }

    fn handle_datagram(&self, data: &str, addr: SocketAddr) -> Result<()> {
        let response = match SipMessage::parse(data)? {
            SipMessage::Response(resp) => resp,
            SipMessage::Request(req) => {
                tracing::debug!(target: "gb28181::sip", method = %req.method, remote = %addr, "Ignoring inbound request");
                return Ok(());
            }
        };

        if response.is_provisional() {
            tracing::debug!(target: "gb28181::sip", status = response.status_code, remote = %addr, "Provisional response");
            return Ok(());
        }

        let branch = response
            .via_branch()
            .ok_or_else(|| GbError::Parse("response without Via branch".to_string()))?;

        // BYE 沿用 INVITE 的 branch，INVITE 2xx 的重传不能结束 BYE 事务
        let method = response.cseq_method();
        match self
            .pending
            .remove_if(&branch, |_, (pending_method, _)| Some(*pending_method) == method)
        {
            Some((_, (_, tx))) => {
                let _ = tx.send(response);
            }
            None => {
                tracing::debug!(
                    target: "gb28181::sip",
                    %branch,
                    cseq_method = ?method,
                    "No pending transaction for response"
                );
            }
        }

        Ok(())
    }

    async fn send_to(&self, request: &SipRequest) -> Result<()> {
        let addr = request
            .destination
            .ok_or_else(|| GbError::InvalidAddress(format!("no destination for {}", request.method)))?;

        let data = request.to_string();
        self.socket
            .send_to(data.as_bytes(), addr)
            .await
            .map_err(|e| GbError::transport(format!("Failed to send {}: {}", request.method, e)))?;

        tracing::debug!(target: "gb28181::sip", method = %request.method, remote = %addr, "Sent SIP request");
        Ok(())
    }
}

#[async_trait]
impl SipTransport for UdpTransport {
    async fn send_request(&self, request: &SipRequest) -> Result<TransactionHandle> {
        let branch = request
            .via_branch()
            .ok_or_else(|| GbError::transport("request without Via branch"))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(branch.clone(), (request.method, tx));
        self.waiting.insert(branch.clone(), rx);

        if let Err(e) = self.send_to(request).await {
            self.pending.remove(&branch);
            self.waiting.remove(&branch);
            return Err(e);
        }

        Ok(TransactionHandle {
            branch,
            method: request.method,
        })
    }

    async fn await_response(&self, handle: &TransactionHandle) -> Result<SipResponse> {
        let (_, rx) = self
            .waiting
            .remove(&handle.branch)
            .ok_or_else(|| GbError::transport(format!("unknown transaction {}", handle.branch)))?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(GbError::transport(format!("transaction {} dropped", handle.branch))),
            Err(_) => {
                self.pending.remove(&handle.branch);
                Err(GbError::Timeout(format!("{} {}", handle.method, handle.branch)))
            }
        }
    }

    async fn send(&self, request: &SipRequest) -> Result<()> {
        self.send_to(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_to(addr: SocketAddr, branch: &str) -> SipRequest {
        method_request_to(SipMethod::Message, addr, branch)
    }

    fn method_request_to(method: SipMethod, addr: SocketAddr, branch: &str) -> SipRequest {
        let mut req = SipRequest::new(method, format!("sip:34020000001320000001@{}", addr));
        req.add_header("Via", format!("SIP/2.0/UDP 127.0.0.1:5060;branch={}", branch));
        req.add_header("CSeq", format!("2 {}", method));
        req.set_destination(addr);
        req
    }

    #[tokio::test]
    async fn test_final_response_matched_by_branch() {
        let transport = Arc::new(UdpTransport::bind("127.0.0.1:0", Duration::from_secs(2)).await.unwrap());
        let local = transport.local_addr().unwrap();
        tokio::spawn(transport.clone().run());

        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_addr = device.local_addr().unwrap();

        let handle = transport.send_request(&request_to(device_addr, "z9hG4bKabc")).await.unwrap();

        let mut buf = vec![0u8; 4096];
        let (len, _) = device.recv_from(&mut buf).await.unwrap();
        let received = SipRequest::parse(&String::from_utf8_lossy(&buf[..len])).unwrap();
        assert_eq!(received.method, SipMethod::Message);

        for status in ["100 Trying", "200 OK"] {
            let reply = format!(
                "SIP/2.0 {}\r\nVia: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKabc\r\nCSeq: 2 MESSAGE\r\nContent-Length: 0\r\n\r\n",
                status
            );
            device.send_to(reply.as_bytes(), local).await.unwrap();
        }

        let response = transport.await_response(&handle).await.unwrap();
        assert_eq!(response.status_code, 200);
    }

    #[tokio::test]
    async fn test_await_response_times_out() {
        let transport = UdpTransport::bind("127.0.0.1:0", Duration::from_millis(50)).await.unwrap();
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let handle = transport
            .send_request(&request_to(silent.local_addr().unwrap(), "z9hG4bKsilent"))
            .await
            .unwrap();

        let err = transport.await_response(&handle).await.unwrap_err();
        assert!(matches!(err, GbError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_send_without_destination_fails() {
        let transport = UdpTransport::bind("127.0.0.1:0", Duration::from_millis(50)).await.unwrap();
        let req = SipRequest::new(SipMethod::Ack, "sip:x@y".to_string());

        assert!(matches!(transport.send(&req).await, Err(GbError::InvalidAddress(_))));
    }

    fn final_response(branch: &str, cseq: &str) -> String {
        format!(
            "SIP/2.0 200 OK\r\nVia: SIP/2.0/UDP 127.0.0.1:5060;branch={}\r\nCSeq: {}\r\nContent-Length: 0\r\n\r\n",
            branch, cseq
        )
    }

    #[tokio::test]
    async fn test_invite_retransmission_does_not_answer_bye() {
        let transport = Arc::new(UdpTransport::bind("127.0.0.1:0", Duration::from_secs(2)).await.unwrap());
        let local = transport.local_addr().unwrap();
        tokio::spawn(transport.clone().run());

        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bye = method_request_to(SipMethod::Bye, device.local_addr().unwrap(), "z9hG4bKinv");
        let handle = transport.send_request(&bye).await.unwrap();

        // 设备未收到 ACK，仍在重传 INVITE 的 200 OK
        device
            .send_to(final_response("z9hG4bKinv", "1 INVITE").as_bytes(), local)
            .await
            .unwrap();
        device
            .send_to(final_response("z9hG4bKinv", "2 BYE").as_bytes(), local)
            .await
            .unwrap();

        let response = transport.await_response(&handle).await.unwrap();
        assert_eq!(response.cseq_method(), Some(SipMethod::Bye));
    }

    #[tokio::test]
    async fn test_mismatched_method_leaves_transaction_open() {
        let transport = Arc::new(UdpTransport::bind("127.0.0.1:0", Duration::from_millis(200)).await.unwrap());
        let local = transport.local_addr().unwrap();
        tokio::spawn(transport.clone().run());

        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bye = method_request_to(SipMethod::Bye, device.local_addr().unwrap(), "z9hG4bKinv");
        let handle = transport.send_request(&bye).await.unwrap();

        device
            .send_to(final_response("z9hG4bKinv", "1 INVITE").as_bytes(), local)
            .await
            .unwrap();

        let err = transport.await_response(&handle).await.unwrap_err();
        assert!(matches!(err, GbError::Timeout(_)));
    }
}
