//! 基于 rustls 的引擎实现。
//!
//! # 设计背景（Why）
//! - rustls 以“缓冲 + 状态查询”的方式暴露 TLS 连接：密文经 `read_tls`/`write_tls` 进出，
//!   明文经 `reader()`/`writer()` 进出；[`RustlsEngine`] 把这一模型折算为
//!   [`TlsEngine`] 的 `wrap`/`unwrap` 结果码，使会话处理器无需感知具体实现。
//! - [`RustlsEngineFactory`] 以 `ArcSwapOption` 保存配置，证书轮换时只替换指针：
//!   新会话读取最新快照，已建立的会话继续持有旧配置直至结束。
//!
//! # 契约（What）
//! - rustls 总是一次吃下全部可用密文，因此 `unwrap` 的 `bytes_consumed` 等于输入长度，
//!   不完整的记录由 rustls 内部缓存；
//! - 握手完成的那一次调用报告 [`HandshakeStatus::Finished`]，此后报告 `NotHandshaking`；
//! - 收到对端 `close_notify` 后入站方向结束，`unwrap` 返回 [`EngineStatus::Closed`]。

use std::{
    fmt,
    io::{self, Read, Write},
    sync::Arc,
};

use arc_swap::ArcSwapOption;
use bytes::BytesMut;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection, pki_types::ServerName};

use crate::{
    engine::{
        DelegatedTask, EngineRequest, EngineResult, EngineStatus, HandshakeStatus, TlsEngine, TlsEngineFactory,
    },
    error::{TlsEngineError, TlsError, TlsFailureClass},
};

/// TLS 记录的最大密文长度（明文上限 + 记录开销）。
const MAX_PACKET_SIZE: usize = 16_709;
/// TLS 记录的最大明文长度。
const MAX_PLAINTEXT_SIZE: usize = 16_384;
const READ_CHUNK: usize = 4096;

/// 以 `rustls::Connection` 实现的引擎。
pub struct RustlsEngine {
    conn: Connection,
    inbound_done: bool,
    outbound_closed: bool,
    finished_reported: bool,
}

impl RustlsEngine {
    /// 包装既有连接。
    pub fn new(conn: impl Into<Connection>) -> Self {
        Self {
            conn: conn.into(),
            inbound_done: false,
            outbound_closed: false,
            finished_reported: false,
        }
    }

    /// 创建客户端引擎。
    pub fn client(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Result<Self, TlsEngineError> {
        let conn = ClientConnection::new(config, server_name).map_err(|error| TlsEngineError::from_rustls(&error))?;
        Ok(Self::new(conn))
    }

    /// 创建服务端引擎。
    pub fn server(config: Arc<ServerConfig>) -> Result<Self, TlsEngineError> {
        let conn = ServerConnection::new(config).map_err(|error| TlsEngineError::from_rustls(&error))?;
        Ok(Self::new(conn))
    }

    /// 把 rustls 待发的密文全部追加到 `dst`。
    fn drain_tls(&mut self, dst: &mut BytesMut) -> Result<usize, TlsEngineError> {
        let mut produced = 0;
        while self.conn.wants_write() {
            let mut chunk = Vec::new();
            let written = self
                .conn
                .write_tls(&mut chunk)
                .map_err(|error| TlsEngineError::from_io(&error))?;
            if written == 0 {
                break;
            }
            dst.extend_from_slice(&chunk);
            produced += written;
        }
        Ok(produced)
    }

    /// 把已解密的明文全部追加到 `dst`。
    fn drain_plaintext(&mut self, dst: &mut BytesMut) -> Result<usize, TlsEngineError> {
        let mut produced = 0;
        let mut chunk = [0_u8; READ_CHUNK];
        loop {
            match self.conn.reader().read(&mut chunk) {
                Ok(0) => {
                    self.inbound_done = true;
                    return Ok(produced);
                }
                Ok(read) => {
                    dst.extend_from_slice(&chunk[..read]);
                    produced += read;
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(produced),
                Err(error) => return Err(TlsEngineError::from_io(&error)),
            }
        }
    }

    /// 调用结束时的握手状态；握手恰在本次完成时报告一次 `Finished`。
    fn next_status(&mut self) -> HandshakeStatus {
        if self.conn.wants_write() {
            HandshakeStatus::NeedWrap
        } else if self.conn.is_handshaking() {
            HandshakeStatus::NeedUnwrap
        } else if !self.finished_reported {
            self.finished_reported = true;
            HandshakeStatus::Finished
        } else {
            HandshakeStatus::NotHandshaking
        }
    }
}

impl TlsEngine for RustlsEngine {
    fn begin_handshake(&mut self) -> Result<(), TlsEngineError> {
        // rustls 在构造连接时已排入首个握手报文。
        Ok(())
    }

    fn wrap(&mut self, src: &[u8], dst: &mut BytesMut) -> Result<EngineResult, TlsEngineError> {
        let mut consumed = 0;
        let mut produced = 0;
        if !src.is_empty() && !self.outbound_closed {
            while consumed < src.len() {
                let accepted = self
                    .conn
                    .writer()
                    .write(&src[consumed..])
                    .map_err(|error| TlsEngineError::from_io(&error))?;
                if accepted == 0 {
                    break;
                }
                consumed += accepted;
                produced += self.drain_tls(dst)?;
            }
        }
        produced += self.drain_tls(dst)?;

        let status = if self.outbound_closed {
            EngineStatus::Closed
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult::new(status, self.next_status(), consumed, produced))
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut BytesMut) -> Result<EngineResult, TlsEngineError> {
        let mut input = src;
        let mut produced = 0;
        while !input.is_empty() && !self.inbound_done {
            let read = self
                .conn
                .read_tls(&mut input)
                .map_err(|error| TlsEngineError::from_io(&error))?;
            if read == 0 {
                break;
            }
            let state = self
                .conn
                .process_new_packets()
                .map_err(|error| TlsEngineError::from_rustls(&error))?;
            produced += self.drain_plaintext(dst)?;
            if state.peer_has_closed() {
                self.inbound_done = true;
            }
        }
        let consumed = src.len() - input.len();

        let status = if self.inbound_done {
            EngineStatus::Closed
        } else if consumed == 0 {
            EngineStatus::BufferUnderflow
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult::new(status, self.next_status(), consumed, produced))
    }

    fn handshake_status(&self) -> HandshakeStatus {
        if self.conn.wants_write() {
            HandshakeStatus::NeedWrap
        } else if self.conn.is_handshaking() {
            HandshakeStatus::NeedUnwrap
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        None
    }

    fn close_inbound(&mut self) -> Result<(), TlsEngineError> {
        let clean = self.inbound_done;
        self.inbound_done = true;
        if clean {
            Ok(())
        } else {
            Err(TlsEngineError::new(
                TlsFailureClass::Transient,
                "inbound closed before receiving close_notify, possible truncation",
            ))
        }
    }

    fn close_outbound(&mut self) {
        if !self.outbound_closed {
            self.conn.send_close_notify();
            self.outbound_closed = true;
        }
    }

    fn is_inbound_done(&self) -> bool {
        self.inbound_done
    }

    fn is_outbound_done(&self) -> bool {
        self.outbound_closed && !self.conn.wants_write()
    }

    fn packet_buffer_size(&self) -> usize {
        MAX_PACKET_SIZE
    }

    fn application_buffer_size(&self) -> usize {
        MAX_PLAINTEXT_SIZE
    }

    fn application_protocol(&self) -> Option<Vec<u8>> {
        self.conn.alpn_protocol().map(<[u8]>::to_vec)
    }

    fn is_client_mode(&self) -> bool {
        matches!(self.conn, Connection::Client(_))
    }
}

impl fmt::Debug for RustlsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsEngine")
            .field("client", &self.is_client_mode())
            .field("handshaking", &self.conn.is_handshaking())
            .field("inbound_done", &self.inbound_done)
            .field("outbound_closed", &self.outbound_closed)
            .finish()
    }
}

/// 可热替换配置的 rustls 引擎工厂。
///
/// # 教案式说明
/// - **意图（Why）**：证书轮换不应打断在线会话；工厂只在创建引擎的瞬间读取配置快照，
///   替换配置只影响之后接入的会话。
/// - **逻辑（How）**：服务端与客户端配置各存放在一个 `ArcSwapOption` 中；
///   `new_engine` 使用 `load_full()` 获取快照，`replace_*` 使用 `swap` 原子替换并返回旧值。
/// - **契约（What）**：
///   - 按 [`EngineRequest::client_mode`] 选择配置，对应配置缺失时返回 `IllegalState`；
///   - 客户端 SNI 优先取 `server_name`，否则回退到对端 IP；二者皆无时返回 `IllegalState`；
///   - 非法的 SNI 以 `Authentication` 类引擎错误返回。
/// - **风险（Trade-offs）**：替换发生时正在创建的引擎可能读取到旧配置，下一次创建即可生效。
#[derive(Default)]
pub struct RustlsEngineFactory {
    server: ArcSwapOption<ServerConfig>,
    client: ArcSwapOption<ClientConfig>,
}

impl RustlsEngineFactory {
    /// 创建不含任何配置的工厂。
    pub fn new() -> Self {
        Self::default()
    }

    /// 只含服务端配置的工厂。
    pub fn server(config: Arc<ServerConfig>) -> Self {
        Self::new().with_server_config(config)
    }

    /// 只含客户端配置的工厂。
    pub fn client(config: Arc<ClientConfig>) -> Self {
        Self::new().with_client_config(config)
    }

    /// 设置服务端配置。
    pub fn with_server_config(self, config: Arc<ServerConfig>) -> Self {
        self.server.store(Some(config));
        self
    }

    /// 设置客户端配置。
    pub fn with_client_config(self, config: Arc<ClientConfig>) -> Self {
        self.client.store(Some(config));
        self
    }

    /// 原子替换服务端配置，返回旧配置。
    pub fn replace_server_config(&self, config: Arc<ServerConfig>) -> Option<Arc<ServerConfig>> {
        self.server.swap(Some(config))
    }

    /// 原子替换客户端配置，返回旧配置。
    pub fn replace_client_config(&self, config: Arc<ClientConfig>) -> Option<Arc<ClientConfig>> {
        self.client.swap(Some(config))
    }

    /// 当前服务端配置快照。
    pub fn server_config(&self) -> Option<Arc<ServerConfig>> {
        self.server.load_full()
    }

    /// 当前客户端配置快照。
    pub fn client_config(&self) -> Option<Arc<ClientConfig>> {
        self.client.load_full()
    }
}

impl TlsEngineFactory for RustlsEngineFactory {
    fn new_engine(&self, request: &EngineRequest<'_>) -> Result<Box<dyn TlsEngine>, TlsError> {
        let engine = if request.client_mode {
            let config = self
                .client
                .load_full()
                .ok_or(TlsError::IllegalState("rustls client configuration is missing"))?;
            RustlsEngine::client(config, resolve_server_name(request)?)?
        } else {
            let config = self
                .server
                .load_full()
                .ok_or(TlsError::IllegalState("rustls server configuration is missing"))?;
            RustlsEngine::server(config)?
        };
        Ok(Box::new(engine))
    }
}

impl fmt::Debug for RustlsEngineFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsEngineFactory")
            .field("server", &self.server.load().is_some())
            .field("client", &self.client.load().is_some())
            .finish()
    }
}

fn resolve_server_name(request: &EngineRequest<'_>) -> Result<ServerName<'static>, TlsError> {
    if let Some(name) = request.server_name {
        return ServerName::try_from(name.to_owned()).map_err(|error| {
            TlsEngineError::new(
                TlsFailureClass::Authentication,
                format!("invalid server name `{name}`: {error}"),
            )
            .into()
        });
    }
    request
        .peer_addr
        .map(|addr| ServerName::IpAddress(addr.ip().into()))
        .ok_or(TlsError::IllegalState("client engine requires a server name or peer address"))
}
