//! GVRET TCP 任务
//!
//! 单线程 `mio` 事件循环：
//! - 同一时间只服务一个客户端，多余的连接直接关闭
//! - 客户端连上时激活总线，断开时失活（没有客户端时不扰动总线）
//! - 自适应轮询：最近 100 ms 内收到过命令字节时 1 ms，否则 50 ms
//! - 只有在可写、解析器处于命令边界、且本轮没有读到命令字节时才发送一个环形缓冲中的帧包，
//!   保证命令响应不会和帧包交错

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use canmux_manager::ClientId;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, trace, warn};

use crate::bridge::BridgeCore;
use crate::error::GvretError;
use crate::parser::Parser;

pub const TCP_THREAD_NAME: &str = "canmux-gvret-tcp";

const LISTENER: Token = Token(0);
const CLIENT: Token = Token(1);
const WAKER: Token = Token(2);

/// 距上次收到命令字节多久之内算交互中
const ACTIVE_WINDOW: Duration = Duration::from_millis(100);
const FAST_POLL: Duration = Duration::from_millis(1);
const IDLE_POLL: Duration = Duration::from_millis(50);

const READ_CHUNK: usize = 256;

pub(crate) struct TcpTask {
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    local_addr: SocketAddr,
    thread: JoinHandle<()>,
}

impl TcpTask {
    /// 绑定监听端口并启动事件循环线程
    pub fn spawn(core: Arc<BridgeCore>, client: ClientId) -> Result<Self, GvretError> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(core.config().bind_addr)?;
        let local_addr = listener.local_addr()?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let task_core = core.clone();
        let thread = thread::Builder::new().name(TCP_THREAD_NAME.into()).spawn(move || {
            let mut server = Server {
                poll,
                listener,
                core: task_core,
                client,
                conn: None,
            };
            server.run(&flag);
        })?;

        core.set_waker(Some(waker.clone()));
        info!("GVRET server listening on {}", local_addr);
        Ok(Self {
            shutdown,
            waker,
            local_addr,
            thread,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(self) {
        self.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake GVRET TCP task: {}", e);
        }
        if self.thread.join().is_err() {
            error!("GVRET TCP task panicked");
        }
    }
}

enum Disconnect {
    PeerClosed,
    Error(io::Error),
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    parser: Parser,
    last_rx: Instant,
    /// 上次写入后套接字仍可写（边沿触发，遇到 WouldBlock 时清零）
    writable: bool,
    /// 待发送字节（命令响应或未写完的帧包）
    pending: Vec<u8>,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            parser: Parser::new(),
            last_rx: Instant::now(),
            writable: false,
            pending: Vec::with_capacity(64),
        }
    }

    fn service(&mut self, core: &BridgeCore, client: ClientId, readable: bool) -> Result<(), Disconnect> {
        let mut received = false;
        if readable {
            received = self.read_commands(core, client)?;
        }

        if self.writable && !self.pending.is_empty() {
            self.flush()?;
        }

        if self.writable
            && self.pending.is_empty()
            && self.parser.is_idle()
            && !received
            && let Some(packet) = core.pop_packet()
        {
            self.pending.extend_from_slice(&packet);
            self.flush()?;
        }
        Ok(())
    }

    /// 读到 WouldBlock 为止，返回是否读到了数据
    fn read_commands(&mut self, core: &BridgeCore, client: ClientId) -> Result<bool, Disconnect> {
        let mut buf = [0u8; READ_CHUNK];
        let mut received = false;
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Err(Disconnect::PeerClosed),
                Ok(n) => {
                    received = true;
                    self.last_rx = Instant::now();
                    for &byte in &buf[..n] {
                        if let Some(command) = self.parser.feed(byte)
                            && let Some(response) = core.handle_command(client, command)
                        {
                            self.pending.extend_from_slice(&response);
                        }
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Disconnect::Error(e)),
            }
        }
        if self.writable && !self.pending.is_empty() {
            self.flush()?;
        }
        Ok(received)
    }

    fn flush(&mut self) -> Result<(), Disconnect> {
        while !self.pending.is_empty() {
            match self.stream.write(&self.pending) {
                Ok(0) => return Err(Disconnect::PeerClosed),
                Ok(n) => {
                    self.pending.drain(..n);
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.writable = false;
                    break;
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Disconnect::Error(e)),
            }
        }
        Ok(())
    }
}

struct Server {
    poll: Poll,
    listener: TcpListener,
    core: Arc<BridgeCore>,
    client: ClientId,
    conn: Option<Connection>,
}

impl Server {
    fn run(&mut self, shutdown: &AtomicBool) {
        let mut events = Events::with_capacity(16);
        while !shutdown.load(Ordering::Acquire) {
            let timeout = self.poll_timeout();
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("GVRET poll failed: {}", e);
                break;
            }

            let mut accept = false;
            let mut readable = false;
            for event in events.iter() {
                match event.token() {
                    LISTENER => accept = true,
                    CLIENT => {
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            readable = true;
                        }
                        if event.is_writable()
                            && let Some(conn) = self.conn.as_mut()
                        {
                            conn.writable = true;
                        }
                    },
                    _ => {},
                }
            }

            if accept {
                self.accept_pending();
            }

            let outcome = match self.conn.as_mut() {
                Some(conn) => conn.service(&self.core, self.client, readable),
                None => Ok(()),
            };
            if let Err(reason) = outcome {
                self.disconnect(reason);
            }
        }

        // 正常停止时由桥接的 stop() 负责失活
        if self.conn.take().is_some() && self.core.is_enabled() {
            self.deactivate();
        }
        trace!("GVRET TCP task exited");
    }

    fn poll_timeout(&self) -> Duration {
        match &self.conn {
            Some(conn)
                if conn.writable
                    && (!conn.pending.is_empty() || (conn.parser.is_idle() && self.core.has_packets())) =>
            {
                Duration::ZERO
            },
            Some(conn) if conn.last_rx.elapsed() < ACTIVE_WINDOW => FAST_POLL,
            _ => IDLE_POLL,
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.conn.is_some() {
                        warn!("GVRET: refusing extra connection from {}", peer);
                        continue;
                    }
                    self.open(stream, peer);
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("GVRET accept failed: {}", e);
                    break;
                },
            }
        }
    }

    fn open(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        if !self.core.is_enabled() {
            debug!("GVRET: bridge stopping, closing {}", peer);
            return;
        }
        self.core.discard_packets();
        if let Err(e) = self.core.manager().activate(self.client) {
            warn!("GVRET: failed to activate CAN bus for {}: {}", peer, e);
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!("GVRET: TCP_NODELAY failed for {}: {}", peer, e);
        }
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, CLIENT, Interest::READABLE | Interest::WRITABLE)
        {
            error!("GVRET: failed to register {}: {}", peer, e);
            self.deactivate();
            return;
        }
        info!("GVRET client connected: {}", peer);
        self.conn = Some(Connection::new(stream, peer));
    }

    fn disconnect(&mut self, reason: Disconnect) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
            trace!("GVRET: deregister failed: {}", e);
        }
        match reason {
            Disconnect::PeerClosed => info!("GVRET client disconnected: {}", conn.peer),
            Disconnect::Error(e) => warn!("GVRET client {} connection error: {}", conn.peer, e),
        }
        self.deactivate();
        let stale = self.core.discard_packets();
        if stale > 0 {
            debug!("GVRET: discarded {} undelivered packet(s)", stale);
        }
    }

    fn deactivate(&self) {
        if let Err(e) = self.core.manager().deactivate(self.client) {
            warn!("GVRET: failed to deactivate CAN client: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canmux_can::{CanFrame, MockCanDriver};
    use canmux_manager::{CanManager, ClientMode, HostScheduler};

    #[test]
    fn test_disconnect_discards_undelivered_packets() {
        let driver = Arc::new(MockCanDriver::new());
        let manager = Arc::new(CanManager::new(driver.clone()));
        let core = BridgeCore::armed(manager.clone(), HostScheduler::default());
        let client = manager.register(ClientMode::TxEnabled).unwrap();

        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut server = Server {
            poll: Poll::new().unwrap(),
            listener,
            core: core.clone(),
            client,
            conn: None,
        };

        let _peer = std::net::TcpStream::connect(addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let (stream, peer) = loop {
            match server.listener.accept() {
                Ok(pair) => break pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(5));
                },
                Err(e) => panic!("accept failed: {}", e),
            }
        };
        server.open(stream, peer);
        assert!(server.conn.is_some());
        assert!(manager.is_active(client));

        core.on_frame(&CanFrame::new_standard(0x10, &[1]).unwrap());
        core.on_frame(&CanFrame::new_standard(0x11, &[2]).unwrap());
        assert!(core.has_packets());

        server.disconnect(Disconnect::PeerClosed);
        assert!(server.conn.is_none());
        assert!(!core.has_packets());
        assert!(!manager.is_active(client));
        assert!(!driver.is_installed());
    }
}
