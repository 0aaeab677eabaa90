// 指令调度
// 点播 / 停播 / 云台控制 / 设备查询

use crate::cache::Cache;
use crate::config::GbConfig;
use crate::manscdp;
use crate::ptz::PtzCommand;
use crate::session::{DialogRecord, StreamSession};
use crate::sip::{correlator, Device, DeviceRegistry, MediaDetail, RequestFactory, SipRequest};
use crate::store::SessionStore;
use crate::transport::SipTransport;
use crate::{GbError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::Instrument;

const LOG_TARGET: &str = "gb28181::dispatcher";

/// 指令调度器
///
/// 同一 (设备, 通道) 上的点播与停播由通道锁串行化，不同通道之间互不阻塞。
/// 流 ID 在发送 INVITE 前预占，同一时刻只能属于一个通道。
pub struct CommandDispatcher {
    factory: RequestFactory,
    transport: Arc<dyn SipTransport>,
    store: SessionStore,
    devices: Arc<dyn DeviceRegistry>,
    channel_locks: DashMap<String, Arc<Mutex<()>>>,

    /// 点播中或已建立的流 ID
    active_streams: DashMap<String, ()>,

    unconfirmed_terminations: AtomicU64,
}

fn channel_key(device_id: &str, channel_id: &str) -> String {
    format!("{}:{}", device_id, channel_id)
}

impl CommandDispatcher {
    pub fn new(
        config: &GbConfig,
        cache: Arc<dyn Cache>,
        transport: Arc<dyn SipTransport>,
        devices: Arc<dyn DeviceRegistry>,
    ) -> Self {
        Self {
            factory: RequestFactory::new(config),
            transport,
            store: SessionStore::from_config(cache, config),
            devices,
            channel_locks: DashMap::new(),
            active_streams: DashMap::new(),
            unconfirmed_terminations: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// BYE 未得到确认（发送失败或非 2xx）的次数
    pub fn unconfirmed_terminations(&self) -> u64 {
        self.unconfirmed_terminations.load(Ordering::Relaxed)
    }

    fn channel_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.channel_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 没有其他任务持有或等待时移除通道锁
    fn release_channel_lock(&self, key: &str, lock: Arc<Mutex<()>>) {
        // 映射表与调用方各持一份
        self.channel_locks
            .remove_if(key, |_, held| Arc::ptr_eq(held, &lock) && Arc::strong_count(held) == 2);
    }

    fn reserve_stream(&self, stream_id: &str) -> Result<()> {
        match self.active_streams.entry(stream_id.to_string()) {
            Entry::Occupied(_) => Err(GbError::StreamAlreadyExists(stream_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(())
            }
        }
    }

    async fn next_seq(&self) -> Result<i64> {
        self.store.cache().next_seq().await
    }

    /// 实时点播
    pub async fn play(
        &self,
        device: &Device,
        media: &MediaDetail,
        stream_id: &str,
        ssrc: &str,
        channel_id: &str,
        rtp_port: u16,
    ) -> Result<StreamSession> {
        let span = tracing::info_span!(
            "gb28181.dispatcher.play",
            device_id = %device.device_id,
            %channel_id,
            %stream_id,
            %ssrc
        );

        async {
            let key = channel_key(&device.device_id, channel_id);
            let lock = self.channel_lock(&key);

            let result = {
                let _guard = lock.lock().await;
                self.start_stream(device, media, stream_id, ssrc, channel_id, rtp_port)
                    .await
            };

            if result.is_err() {
                self.release_channel_lock(&key, lock);
            }
            result
        }
        .instrument(span)
        .await
    }

    /// 持有通道锁时调用
    async fn start_stream(
        &self,
        device: &Device,
        media: &MediaDetail,
        stream_id: &str,
        ssrc: &str,
        channel_id: &str,
        rtp_port: u16,
    ) -> Result<StreamSession> {
        match self.store.get_dialog(&device.device_id, channel_id).await {
            Ok(existing) => {
                return Err(GbError::ChannelBusy(format!(
                    "{}/{} is streaming {}",
                    device.device_id, channel_id, existing.stream_id
                )));
            }
            Err(GbError::SessionNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        self.reserve_stream(stream_id)?;

        let result = self
            .establish(device, media, stream_id, ssrc, channel_id, rtp_port)
            .await;
        if result.is_err() {
            self.active_streams.remove(stream_id);
        }
        result
    }

    async fn establish(
        &self,
        device: &Device,
        media: &MediaDetail,
        stream_id: &str,
        ssrc: &str,
        channel_id: &str,
        rtp_port: u16,
    ) -> Result<StreamSession> {
        // 预占之外还要看缓存，记录可能由其他调度器实例写入
        match self.store.get_stream(stream_id).await {
            Ok(_) => return Err(GbError::StreamAlreadyExists(stream_id.to_string())),
            Err(GbError::SessionNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let seq = self.next_seq().await?;
        let invite = self
            .factory
            .invite(device, media, channel_id, ssrc, rtp_port, seq)?;

        tracing::debug!(target: LOG_TARGET, "Sending INVITE:\n{}", invite);

        let handle = self.transport.send_request(&invite).await?;
        let response = self.transport.await_response(&handle).await?;

        if !response.is_success() {
            tracing::warn!(
                target: LOG_TARGET,
                status = response.status_code,
                "INVITE rejected: {}",
                response.reason_phrase
            );
            return Err(GbError::Rejected {
                status: response.status_code,
                reason: response.reason_phrase.clone(),
            });
        }

        let ack = self.factory.ack(&invite, &response);
        if let Err(e) = self.transport.send(&ack).await {
            tracing::error!(target: LOG_TARGET, "Failed to send ACK: {}", e);
            return Err(e);
        }

        let dialog = correlator::extract(&invite, &response)?;

        let session = StreamSession::new(
            stream_id.to_string(),
            device.device_id.clone(),
            channel_id.to_string(),
            media.ip.clone(),
            ssrc.to_string(),
            dialog,
        );

        self.store.save_stream(&session).await?;
        if let Err(e) = self
            .store
            .save_dialog(&device.device_id, channel_id, stream_id, ssrc, &session.dialog)
            .await
        {
            tracing::error!(target: LOG_TARGET, "Failed to save dialog info: {}", e);
            if let Err(cleanup) = self.store.delete_stream(stream_id).await {
                tracing::warn!(target: LOG_TARGET, "Stream info left behind: {}", cleanup);
            }
            return Err(e);
        }

        tracing::info!(target: LOG_TARGET, call_id = %session.dialog.call_id, "Stream started");
        Ok(session)
    }

    /// 停止点播
    ///
    /// 只有对话记录不存在时返回错误；本地记录清理后，BYE 的发送结果只记录日志。
    pub async fn stop_play(&self, stream_id: &str, channel_id: &str, device: &Device) -> Result<()> {
        let span = tracing::info_span!(
            "gb28181.dispatcher.stop_play",
            device_id = %device.device_id,
            %channel_id,
            %stream_id
        );

        async {
            let key = channel_key(&device.device_id, channel_id);
            let lock = self.channel_lock(&key);

            let result = {
                let _guard = lock.lock().await;
                self.stop_stream(stream_id, channel_id, device).await
            };

            self.release_channel_lock(&key, lock);
            result
        }
        .instrument(span)
        .await
    }

    /// 持有通道锁时调用
    async fn stop_stream(&self, stream_id: &str, channel_id: &str, device: &Device) -> Result<()> {
        let record = self.store.get_dialog(&device.device_id, channel_id).await?;

        self.store.delete_stream(stream_id).await?;
        self.active_streams.remove(stream_id);
        if record.stream_id != stream_id {
            tracing::warn!(
                target: LOG_TARGET,
                recorded = %record.stream_id,
                "Dialog belongs to another stream, removing it as well"
            );
            self.store.delete_stream(&record.stream_id).await?;
            self.active_streams.remove(&record.stream_id);
        }

        let bye = self.build_bye(device, channel_id, &record).await;

        self.store.delete_dialog(&device.device_id, channel_id).await?;

        match bye {
            Ok(bye) => self.terminate(&bye).await,
            Err(e) => self.count_unconfirmed(&format!("failed to build BYE: {}", e)),
        }

        tracing::info!(target: LOG_TARGET, call_id = %record.dialog.call_id, "Stream stopped");
        Ok(())
    }

    async fn build_bye(&self, device: &Device, channel_id: &str, record: &DialogRecord) -> Result<SipRequest> {
        let seq = self.next_seq().await?;
        self.factory.bye(device, channel_id, record, seq)
    }

    async fn terminate(&self, bye: &SipRequest) {
        let handle = match self.transport.send_request(bye).await {
            Ok(handle) => handle,
            Err(e) => return self.count_unconfirmed(&format!("failed to send BYE: {}", e)),
        };

        match self.transport.await_response(&handle).await {
            Ok(response) if response.is_success() => {
                tracing::debug!(target: LOG_TARGET, "BYE confirmed");
            }
            Ok(response) => self.count_unconfirmed(&format!(
                "BYE answered with {} {}",
                response.status_code, response.reason_phrase
            )),
            Err(e) => self.count_unconfirmed(&format!("no BYE response: {}", e)),
        }
    }

    fn count_unconfirmed(&self, reason: &str) {
        self.unconfirmed_terminations.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(target: LOG_TARGET, "Stream termination unconfirmed: {}", reason);
    }

    /// 云台控制
    pub async fn control_ptz(&self, device_id: &str, channel_id: &str, command: &PtzCommand) -> Result<()> {
        let span = tracing::info_span!("gb28181.dispatcher.control_ptz", %device_id, %channel_id);

        async {
            let device = self
                .devices
                .get_device_by_id(device_id)
                .await
                .ok_or_else(|| GbError::DeviceNotFound(device_id.to_string()))?;

            let frame = command.encode();
            let seq = self.next_seq().await?;
            let body = manscdp::ptz_control(seq, channel_id, &frame)?;
            let request = self.factory.message(&device, body, seq)?;

            let handle = self.transport.send_request(&request).await?;
            let response = self.transport.await_response(&handle).await?;

            if !response.is_success() {
                return Err(GbError::Rejected {
                    status: response.status_code,
                    reason: response.reason_phrase.clone(),
                });
            }

            tracing::info!(target: LOG_TARGET, ptz_cmd = %frame, "PTZ command delivered");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// 设备信息查询，随后总是发起目录查询
    pub async fn device_info_query(&self, device: &Device) -> Result<()> {
        let span = tracing::info_span!("gb28181.dispatcher.device_info_query", device_id = %device.device_id);

        async {
            let seq = self.next_seq().await?;
            let body = manscdp::device_info_query(seq, &device.device_id)?;
            self.send_query(device, manscdp::CMD_DEVICE_INFO, body, seq).await;

            self.catalog_query(device).await
        }
        .instrument(span)
        .await
    }

    /// 设备目录查询
    pub async fn catalog_query(&self, device: &Device) -> Result<()> {
        let span = tracing::info_span!("gb28181.dispatcher.catalog_query", device_id = %device.device_id);

        async {
            let seq = self.next_seq().await?;
            let body = manscdp::catalog_query(seq, &device.device_id)?;
            self.send_query(device, manscdp::CMD_CATALOG, body, seq).await;
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// 发送查询 MESSAGE，传输失败只记日志；响应在后台等待
    async fn send_query(&self, device: &Device, cmd_type: &'static str, body: String, seq: i64) {
        let request = match self.factory.message(device, body, seq) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(target: LOG_TARGET, %cmd_type, "Failed to build query: {}", e);
                return;
            }
        };

        let handle = match self.transport.send_request(&request).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(target: LOG_TARGET, %cmd_type, "Failed to send query: {}", e);
                return;
            }
        };

        let transport = self.transport.clone();
        let device_id = device.device_id.clone();
        tokio::spawn(async move {
            match transport.await_response(&handle).await {
                Ok(response) if response.is_success() => {
                    tracing::debug!(target: LOG_TARGET, %device_id, %cmd_type, "Query accepted");
                }
                Ok(response) => {
                    tracing::warn!(
                        target: LOG_TARGET,
                        %device_id,
                        %cmd_type,
                        status = response.status_code,
                        "Query refused"
                    );
                }
                Err(e) => {
                    tracing::warn!(target: LOG_TARGET, %device_id, %cmd_type, "No query response: {}", e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::sip::{DeviceManager, SipHeaders, SipMethod, SipResponse};
    use crate::transport::TransactionHandle;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    const CHANNEL_1: &str = "34020000001320000011";
    const CHANNEL_2: &str = "34020000001320000012";

    /// 应答所有请求；INVITE 的状态码与应答延迟可配置
    struct ScriptedTransport {
        invite_status: u16,
        delay: Duration,
        requests: std::sync::Mutex<HashMap<String, SipRequest>>,
        sent: std::sync::Mutex<Vec<SipMethod>>,
    }

    impl ScriptedTransport {
        fn new(invite_status: u16) -> Self {
            Self {
                invite_status,
                delay: Duration::ZERO,
                requests: std::sync::Mutex::new(HashMap::new()),
                sent: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn sent(&self) -> Vec<SipMethod> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SipTransport for ScriptedTransport {
        async fn send_request(&self, request: &SipRequest) -> Result<TransactionHandle> {
            let branch = request.via_branch().unwrap();
            self.sent.lock().unwrap().push(request.method);
            self.requests.lock().unwrap().insert(branch.clone(), request.clone());
            Ok(TransactionHandle {
                branch,
                method: request.method,
            })
        }

        async fn await_response(&self, handle: &TransactionHandle) -> Result<SipResponse> {
            tokio::time::sleep(self.delay).await;
            let request = self.requests.lock().unwrap().remove(&handle.branch).unwrap();
            let status = if request.method == SipMethod::Invite {
                self.invite_status
            } else {
                200
            };

            let mut response = SipResponse::new(status, "Scripted".to_string());
            response.add_header("Via", request.header("Via").unwrap());
            response.add_header("To", format!("{};tag=device-tag", request.header("To").unwrap()));
            response.add_header("Call-ID", request.call_id().unwrap());
            Ok(response)
        }

        async fn send(&self, request: &SipRequest) -> Result<()> {
            self.sent.lock().unwrap().push(request.method);
            Ok(())
        }
    }

    fn device() -> Device {
        Device::new("34020000001320000001".to_string(), "127.0.0.1".to_string(), 5062)
    }

    fn dispatcher(transport: Arc<ScriptedTransport>) -> CommandDispatcher {
        dispatcher_with_cache(transport, Arc::new(MemoryCache::new()))
    }

    fn dispatcher_with_cache(transport: Arc<ScriptedTransport>, cache: Arc<dyn Cache>) -> CommandDispatcher {
        CommandDispatcher::new(&GbConfig::default(), cache, transport, Arc::new(DeviceManager::new()))
    }

    /// 拒绝写入对话记录的缓存
    #[derive(Default)]
    struct DialogWriteRefused {
        inner: MemoryCache,
    }

    #[async_trait]
    impl Cache for DialogWriteRefused {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: String) -> Result<()> {
            if key.starts_with("stream_transaction:") {
                return Err(GbError::cache("write refused"));
            }
            self.inner.set(key, value).await
        }

        async fn del(&self, key: &str) -> Result<bool> {
            self.inner.del(key).await
        }

        async fn next_seq(&self) -> Result<i64> {
            self.inner.next_seq().await
        }
    }

    #[tokio::test]
    async fn test_play_persists_both_records() {
        let transport = Arc::new(ScriptedTransport::new(200));
        let dispatcher = dispatcher(transport.clone());
        let media = MediaDetail::new("media-1", "127.0.0.1");

        let session = dispatcher
            .play(&device(), &media, "stream-1", "0100000001", "34020000001320000011", 30000)
            .await
            .unwrap();

        assert_eq!(session.dialog.to_tag, "device-tag");
        assert_eq!(transport.sent(), vec![SipMethod::Invite, SipMethod::Ack]);

        let record = dispatcher
            .store()
            .get_dialog("34020000001320000001", "34020000001320000011")
            .await
            .unwrap();
        assert_eq!(record.stream_id, "stream-1");
        assert_eq!(record.dialog, session.dialog);
    }

    #[tokio::test]
    async fn test_rejected_invite_has_no_side_effects() {
        let transport = Arc::new(ScriptedTransport::new(486));
        let dispatcher = dispatcher(transport.clone());
        let media = MediaDetail::new("media-1", "127.0.0.1");

        let err = dispatcher
            .play(&device(), &media, "stream-1", "0100000001", "34020000001320000011", 30000)
            .await
            .unwrap_err();

        assert!(matches!(err, GbError::Rejected { status: 486, .. }));
        assert_eq!(transport.sent(), vec![SipMethod::Invite]);
        assert!(dispatcher.store().get_stream("stream-1").await.is_err());
    }

    #[tokio::test]
    async fn test_second_play_on_channel_is_busy() {
        let transport = Arc::new(ScriptedTransport::new(200));
        let dispatcher = dispatcher(transport.clone());
        let media = MediaDetail::new("media-1", "127.0.0.1");

        dispatcher
            .play(&device(), &media, "stream-1", "0100000001", "34020000001320000011", 30000)
            .await
            .unwrap();
        let err = dispatcher
            .play(&device(), &media, "stream-2", "0100000002", "34020000001320000011", 30002)
            .await
            .unwrap_err();

        assert!(matches!(err, GbError::ChannelBusy(_)));
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_sends_bye_with_stored_dialog() {
        let transport = Arc::new(ScriptedTransport::new(200));
        let dispatcher = dispatcher(transport.clone());
        let media = MediaDetail::new("media-1", "127.0.0.1");

        dispatcher
            .play(&device(), &media, "stream-1", "0100000001", "34020000001320000011", 30000)
            .await
            .unwrap();
        dispatcher
            .stop_play("stream-1", "34020000001320000011", &device())
            .await
            .unwrap();

        assert_eq!(
            transport.sent(),
            vec![SipMethod::Invite, SipMethod::Ack, SipMethod::Bye]
        );
        assert_eq!(dispatcher.unconfirmed_terminations(), 0);
    }

    #[tokio::test]
    async fn test_stream_id_is_claimed_by_one_channel() {
        let transport = Arc::new(ScriptedTransport::new(200).with_delay(Duration::from_millis(50)));
        let dispatcher = dispatcher(transport.clone());
        let media = MediaDetail::new("media-1", "127.0.0.1");
        let dev = device();

        let (a, b) = tokio::join!(
            dispatcher.play(&dev, &media, "stream-x", "0100000001", CHANNEL_1, 30000),
            dispatcher.play(&dev, &media, "stream-x", "0100000002", CHANNEL_2, 30002),
        );

        let (winner, loser) = match (a, b) {
            (Ok(session), Err(e)) | (Err(e), Ok(session)) => (session, e),
            (a, b) => panic!("expected exactly one success: {:?} / {:?}", a.is_ok(), b.is_ok()),
        };
        assert!(matches!(loser, GbError::StreamAlreadyExists(_)));
        assert_eq!(transport.sent(), vec![SipMethod::Invite, SipMethod::Ack]);

        let other = if winner.channel_id == CHANNEL_1 { CHANNEL_2 } else { CHANNEL_1 };
        assert!(dispatcher.store().get_dialog(&dev.device_id, other).await.is_err());

        // 停播后流 ID 可再次使用
        dispatcher.stop_play("stream-x", &winner.channel_id, &dev).await.unwrap();
        dispatcher
            .play(&dev, &media, "stream-x", "0100000003", other, 30004)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_channel_locks_released() {
        let transport = Arc::new(ScriptedTransport::new(200));
        let dispatcher = dispatcher(transport.clone());
        let media = MediaDetail::new("media-1", "127.0.0.1");

        dispatcher
            .play(&device(), &media, "stream-1", "0100000001", CHANNEL_1, 30000)
            .await
            .unwrap();
        assert_eq!(dispatcher.channel_locks.len(), 1);

        dispatcher.stop_play("stream-1", CHANNEL_1, &device()).await.unwrap();
        assert!(dispatcher.channel_locks.is_empty());
        assert!(dispatcher.active_streams.is_empty());

        let rejected = dispatcher_rejecting();
        assert!(rejected
            .play(&device(), &media, "stream-2", "0100000002", CHANNEL_2, 30002)
            .await
            .is_err());
        assert!(rejected.channel_locks.is_empty());
        assert!(rejected.active_streams.is_empty());

        assert!(dispatcher.stop_play("stream-9", CHANNEL_2, &device()).await.is_err());
        assert!(dispatcher.channel_locks.is_empty());
    }

    fn dispatcher_rejecting() -> CommandDispatcher {
        dispatcher(Arc::new(ScriptedTransport::new(486)))
    }

    #[tokio::test]
    async fn test_dialog_write_failure_removes_stream_info() {
        let transport = Arc::new(ScriptedTransport::new(200));
        let cache = Arc::new(DialogWriteRefused::default());
        let dispatcher = dispatcher_with_cache(transport.clone(), cache.clone());
        let media = MediaDetail::new("media-1", "127.0.0.1");

        let err = dispatcher
            .play(&device(), &media, "stream-1", "0100000001", CHANNEL_1, 30000)
            .await
            .unwrap_err();

        assert!(matches!(err, GbError::Cache(_)));
        assert!(cache.inner.is_empty());
        assert!(dispatcher.active_streams.is_empty());

        // 重试不会因残留记录被判为重复流
        let retry = dispatcher
            .play(&device(), &media, "stream-1", "0100000001", CHANNEL_1, 30000)
            .await
            .unwrap_err();
        assert!(matches!(retry, GbError::Cache(_)));
    }
}
