//! QUIC 传输实现
//!
//! 基于 quiche + mio 的阻塞式客户端，所有I/O在调用线程上驱动。
//!
//! - 协商: 第一个客户端双向流，发送 `StreamInfo`（带FIN），读取一条 `StreamValidation`
//! - 上行: 下一个客户端双向流，连续发送 `StreamData`，半关闭 = 零长度FIN
//! - 服务端在上行流上回送的 `Ack` 只读取并记录日志

use crate::assembler::OutboundFrame;
use crate::config::QuicSettings;
use crate::framing::{frame_message, StreamParser};
use crate::proto::{Ack, StreamData, StreamInfo, StreamValidation};
use crate::transport::{FrameSink, StreamService, TransportError};
use prost::Message;
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// 应用层协议标识
pub const ALPN: &[u8] = b"live-streamer-v1";

/// 单个QUIC连接及其事件循环
struct QuicSession {
    socket: mio::net::UdpSocket,
    poll: mio::Poll,
    events: mio::Events,
    conn: quiche::Connection,
    local_addr: SocketAddr,
    buf: Vec<u8>,
    out: Vec<u8>,
    parsers: HashMap<u64, StreamParser>,
    finished: HashSet<u64>,
    next_stream_id: u64,
}

impl QuicSession {
    /// 建立连接并完成握手，超过 `deadline` 返回超时
    fn connect(url: &Url, settings: &QuicSettings, deadline: Instant) -> Result<Self, TransportError> {
        // Resolve server address.
        let peer_addr = url
            .socket_addrs(|| None)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Handshake(format!("无法解析地址 {url}")))?;

        // Bind to INADDR_ANY or IN6ADDR_ANY depending on the IP family of the
        // server address.
        let bind_addr: SocketAddr = match peer_addr {
            SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
            SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
        };

        let poll = mio::Poll::new()?;
        let mut socket = mio::net::UdpSocket::bind(bind_addr)?;
        poll.registry()
            .register(&mut socket, mio::Token(0), mio::Interest::READABLE)?;

        let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION)?;
        config.verify_peer(settings.verify_peer);
        config.set_application_protos(&[ALPN])?;
        config.set_max_idle_timeout(settings.max_idle_timeout_ms);
        config.set_max_recv_udp_payload_size(settings.max_datagram_size);
        config.set_max_send_udp_payload_size(settings.max_datagram_size);
        config.set_initial_max_data(settings.initial_max_data);
        config.set_initial_max_stream_data_bidi_local(settings.initial_max_stream_data);
        config.set_initial_max_stream_data_bidi_remote(settings.initial_max_stream_data);
        config.set_initial_max_streams_bidi(100);
        config.set_initial_max_streams_uni(100);
        config.set_disable_active_migration(true);

        // Generate a random source connection ID for the connection.
        let mut scid = [0; quiche::MAX_CONN_ID_LEN];
        SystemRandom::new()
            .fill(&mut scid[..])
            .map_err(|_| TransportError::Handshake("随机数生成失败".to_string()))?;
        let scid_hex = hex::encode(scid);
        let scid = quiche::ConnectionId::from_ref(&scid);

        let local_addr = socket.local_addr()?;
        let conn = quiche::connect(url.domain(), &scid, local_addr, peer_addr, &mut config)?;

        info!(
            "连接到 {} 从 {} 使用scid {}",
            peer_addr,
            local_addr,
            scid_hex
        );

        let mut session = Self {
            socket,
            poll,
            events: mio::Events::with_capacity(1024),
            conn,
            local_addr,
            buf: vec![0; 65535],
            out: vec![0; settings.max_datagram_size],
            parsers: HashMap::new(),
            finished: HashSet::new(),
            // 客户端发起的双向流: 0, 4, 8, ...
            next_stream_id: 0,
        };

        session.flush()?;

        while !session.conn.is_established() {
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout);
            }
            session.pump(Some(deadline)).map_err(|e| match e {
                TransportError::Closed(reason) => TransportError::Handshake(reason),
                other => other,
            })?;
        }

        info!("握手完成, 对端 {}", peer_addr);
        Ok(session)
    }

    /// 分配下一个客户端双向流ID
    fn open_stream(&mut self) -> u64 {
        let stream_id = self.next_stream_id;
        self.next_stream_id += 4;
        stream_id
    }

    /// 驱动一次事件循环: 等待可读或超时，收包，收集可读流，发包
    ///
    /// 等待时间取连接定时器与 `deadline` 中较早者；`deadline` 为 `None` 时只受连接定时器约束。
    fn pump(&mut self, deadline: Option<Instant>) -> Result<(), TransportError> {
        let mut timeout = self.conn.timeout();
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            timeout = Some(timeout.map_or(remaining, |t| t.min(remaining)));
        }

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() != ErrorKind::Interrupted {
                return Err(e.into());
            }
        }

        if self.events.is_empty() {
            trace!("等待超时");
            self.conn.on_timeout();
        }

        // Read incoming UDP packets until there are no more packets to read.
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.buf) {
                Ok(v) => v,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            };

            trace!("收到 {len} 字节");

            let recv_info = quiche::RecvInfo {
                to: self.local_addr,
                from,
            };

            // Process potentially coalesced packets.
            if let Err(e) = self.conn.recv(&mut self.buf[..len], recv_info) {
                error!("接收操作失败: {e:?}");
            }
        }

        self.collect_readable()?;
        self.flush()?;

        if self.conn.is_closed() {
            return Err(TransportError::Closed(self.close_reason()));
        }

        Ok(())
    }

    /// 把所有可读流的数据追加到各自的解析器
    fn collect_readable(&mut self) -> Result<(), TransportError> {
        let readable: Vec<u64> = self.conn.readable().collect();

        for stream_id in readable {
            loop {
                match self.conn.stream_recv(stream_id, &mut self.buf) {
                    Ok((read, fin)) => {
                        trace!("流 {} 收到 {} 字节 (fin? {})", stream_id, read, fin);
                        self.parsers
                            .entry(stream_id)
                            .or_default()
                            .append_data(&self.buf[..read])?;
                        if fin {
                            self.finished.insert(stream_id);
                            break;
                        }
                    }
                    Err(quiche::Error::Done) => break,
                    Err(e) => {
                        warn!("流 {} 接收失败: {:?}", stream_id, e);
                        self.finished.insert(stream_id);
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// 发出quiche待发送的所有数据包
    fn flush(&mut self) -> Result<(), TransportError> {
        loop {
            let (write, send_info) = match self.conn.send(&mut self.out) {
                Ok(v) => v,
                Err(quiche::Error::Done) => break,
                Err(e) => {
                    error!("发送操作失败: {e:?}");
                    self.conn.close(false, 0x1, b"fail").ok();
                    return Err(e.into());
                }
            };

            if let Err(e) = self.socket.send_to(&self.out[..write], send_info.to) {
                if e.kind() == ErrorKind::WouldBlock {
                    debug!("发送操作将阻塞");
                    break;
                }
                return Err(e.into());
            }

            trace!("已写入 {write}");
        }

        Ok(())
    }

    /// 写入全部数据，流控不足时驱动事件循环等待
    fn write_all(&mut self, stream_id: u64, data: &[u8], deadline: Option<Instant>) -> Result<(), TransportError> {
        let mut offset = 0;

        while offset < data.len() {
            match self.conn.stream_send(stream_id, &data[offset..], false) {
                Ok(written) => offset += written,
                Err(quiche::Error::Done) => {}
                Err(e) => return Err(e.into()),
            }

            self.flush()?;

            if offset < data.len() {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(TransportError::Timeout);
                }
                trace!("流 {} 等待发送窗口, 剩余 {} 字节", stream_id, data.len() - offset);
                self.pump(deadline)?;
            }
        }

        Ok(())
    }

    /// 发送FIN
    fn finish(&mut self, stream_id: u64) -> Result<(), TransportError> {
        self.conn.stream_send(stream_id, &[], true)?;
        self.flush()
    }

    /// 读取流上的下一条消息
    fn read_message<M: Message + Default>(&mut self, stream_id: u64, deadline: Instant) -> Result<M, TransportError> {
        loop {
            if let Some(parser) = self.parsers.get_mut(&stream_id) {
                if let Some(message) = parser.try_parse_next::<M>()? {
                    return Ok(message);
                }
            }

            if self.finished.contains(&stream_id) {
                return Err(TransportError::Closed(format!("流 {stream_id} 在响应前结束")));
            }

            if Instant::now() >= deadline {
                return Err(TransportError::Timeout);
            }

            self.pump(Some(deadline))?;
        }
    }

    /// 取出流上已完整到达的消息，不阻塞
    fn drain_messages<M: Message + Default>(&mut self, stream_id: u64) -> Result<Vec<M>, TransportError> {
        let mut messages = Vec::new();
        if let Some(parser) = self.parsers.get_mut(&stream_id) {
            while let Some(message) = parser.try_parse_next::<M>()? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    fn close_reason(&self) -> String {
        if let Some(e) = self.conn.peer_error() {
            format!(
                "对端关闭 code={} reason={}",
                e.error_code,
                String::from_utf8_lossy(&e.reason)
            )
        } else if self.conn.is_timed_out() {
            "空闲超时".to_string()
        } else {
            "本地关闭".to_string()
        }
    }
}

impl Drop for QuicSession {
    fn drop(&mut self) {
        if !self.conn.is_closed() {
            self.conn.close(true, 0x00, b"kthxbye").ok();
            self.flush().ok();
            info!("连接已关闭, {:?}", self.conn.stats());
        }
    }
}

/// 基于QUIC的流服务
///
/// 连接在首次协商时建立，握手计入协商超时。
pub struct QuicStreamService {
    url: Url,
    settings: QuicSettings,
    session: Option<QuicSession>,
}

impl QuicStreamService {
    pub fn new(url: Url, settings: QuicSettings) -> Self {
        Self {
            url,
            settings,
            session: None,
        }
    }
}

impl StreamService for QuicStreamService {
    type Uplink = QuicUplink;

    fn new_stream(&mut self, info: StreamInfo, timeout: Duration) -> Result<StreamValidation, TransportError> {
        let deadline = Instant::now() + timeout;

        let mut session = match self.session.take() {
            Some(session) => session,
            None => QuicSession::connect(&self.url, &self.settings, deadline)?,
        };

        let stream_id = session.open_stream();
        debug!("协商流 {}", stream_id);

        let request = frame_message(&info)?;
        session.write_all(stream_id, &request, Some(deadline))?;
        session.finish(stream_id)?;

        let validation = session.read_message::<StreamValidation>(stream_id, deadline)?;
        self.session = Some(session);

        Ok(validation)
    }

    fn send_stream(self) -> Result<QuicUplink, TransportError> {
        let Some(mut session) = self.session else {
            return Err(TransportError::Closed("尚未建立连接".to_string()));
        };

        let stream_id = session.open_stream();
        info!("打开上行流 {}", stream_id);

        Ok(QuicUplink {
            session,
            stream_id,
            linger: self.settings.linger,
            acks: 0,
        })
    }
}

/// QUIC上行流
pub struct QuicUplink {
    session: QuicSession,
    stream_id: u64,
    linger: Duration,
    acks: u64,
}

impl QuicUplink {
    fn drain_acks(&mut self) -> Result<(), TransportError> {
        for ack in self.session.drain_messages::<Ack>(self.stream_id)? {
            self.acks += 1;
            if ack.error != 0 {
                warn!("服务端确认报告错误: {:?}", ack.error());
            } else {
                trace!("收到确认, 服务端缓冲 {} 帧", ack.size);
            }
        }
        Ok(())
    }
}

impl FrameSink for QuicUplink {
    fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
        let data = frame_message(&StreamData::from(frame))?;
        self.session.write_all(self.stream_id, &data, None)?;

        // 不阻塞地处理已到达的包和确认
        self.session.pump(Some(Instant::now()))?;
        self.drain_acks()
    }

    fn close_send(&mut self) -> Result<(), TransportError> {
        self.session.finish(self.stream_id)?;
        debug!("上行流 {} 已半关闭", self.stream_id);

        let deadline = Instant::now() + self.linger;
        while !self.session.finished.contains(&self.stream_id) {
            if Instant::now() >= deadline {
                debug!("等待对端结束超时, 共收到 {} 个确认", self.acks);
                return Ok(());
            }
            self.session.pump(Some(deadline))?;
            self.drain_acks()?;
        }

        info!("对端已结束上行流 {}, 共收到 {} 个确认", self.stream_id, self.acks);
        Ok(())
    }
}
