//! GVRET 桥接端到端测试（虚拟控制器 + 本机 TCP）

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use canmux_can::{CanFrame, MockCanDriver};
use canmux_gvret::protocol::{self, decode_frame, encode_build_frame};
use canmux_gvret::{GvretBridge, GvretConfig};
use canmux_manager::{CanManager, HostScheduler};
use serial_test::serial;

fn setup(bind_addr: SocketAddr) -> (Arc<MockCanDriver>, Arc<CanManager>, GvretBridge) {
    let driver = Arc::new(MockCanDriver::new());
    let manager = Arc::new(CanManager::new(driver.clone()));
    let config = GvretConfig {
        bind_addr,
        ..GvretConfig::default()
    };
    let bridge = GvretBridge::new(manager.clone(), HostScheduler::default(), config);
    (driver, manager, bridge)
}

fn any_port() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn connect(bridge: &GvretBridge) -> TcpStream {
    let stream = TcpStream::connect(bridge.local_addr().unwrap()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream
}

fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).unwrap();
    buf
}

/// 启动后不激活；客户端连上激活，断开后失活
#[test]
fn test_connection_drives_activation() {
    let (driver, manager, bridge) = setup(any_port());
    bridge.start(4, 5, 500_000).unwrap();
    assert!(bridge.is_running());
    assert_eq!(manager.counts().registered, 1);
    assert_eq!(manager.counts().active, 0);
    assert!(!driver.is_installed());

    let stream = connect(&bridge);
    assert!(wait_until(Duration::from_secs(2), || manager.counts().active == 1));
    assert!(driver.is_installed());

    drop(stream);
    assert!(wait_until(Duration::from_secs(2), || manager.counts().active == 0));
    assert!(!driver.is_installed());

    bridge.stop();
    assert!(!bridge.is_running());
    assert_eq!(manager.counts().registered, 0);
}

#[test]
fn test_command_responses() {
    let (_driver, _manager, bridge) = setup(any_port());
    bridge.start(4, 5, 500_000).unwrap();
    let mut stream = connect(&bridge);

    stream.write_all(&[0xE7, 0xE7, 0xF1, 0x07]).unwrap();
    assert_eq!(read_n(&mut stream, 8), protocol::dev_info().to_vec());

    stream.write_all(&[0xF1, 0x06, 0xF1, 0x0C, 0xF1, 0x09]).unwrap();
    assert_eq!(read_n(&mut stream, 12), protocol::canbus_params(500_000).to_vec());
    assert_eq!(read_n(&mut stream, 3), vec![0xF1, 0x0C, 0x01]);
    assert_eq!(read_n(&mut stream, 4), vec![0xF1, 0x09, 0xDE, 0xAD]);

    stream.write_all(&[0xF1, 0x01]).unwrap();
    let sync = read_n(&mut stream, 6);
    assert_eq!(&sync[..2], &[0xF1, 0x01]);
}

#[test]
fn test_received_frames_are_forwarded() {
    let (driver, manager, bridge) = setup(any_port());
    bridge.start(4, 5, 500_000).unwrap();
    let mut stream = connect(&bridge);
    assert!(wait_until(Duration::from_secs(2), || manager.counts().active == 1));

    let frame = CanFrame::new_extended(0x18DA_F110, &[0x02, 0x10, 0x03]).unwrap();
    assert!(driver.inject_rx(frame));

    let packet = read_n(&mut stream, 11 + 3);
    let decoded = decode_frame(&packet).unwrap();
    assert_eq!(decoded.bus, 0);
    assert_eq!(decoded.frame.id, 0x18DA_F110);
    assert!(decoded.frame.is_extended);
    assert_eq!(decoded.frame.data_slice(), &[0x02, 0x10, 0x03]);

    assert!(wait_until(Duration::from_secs(1), || bridge.get_stats().0 == 1));
}

#[test]
fn test_filters_reject_frames() {
    let (driver, manager, bridge) = setup(any_port());
    bridge.start(4, 5, 500_000).unwrap();
    bridge.add_filter(0x100, 0x7FF, false);
    let mut stream = connect(&bridge);
    assert!(wait_until(Duration::from_secs(2), || manager.counts().active == 1));

    driver.inject_rx(CanFrame::new_standard(0x200, &[1]).unwrap());
    driver.inject_rx(CanFrame::new_standard(0x100, &[2]).unwrap());

    let decoded = decode_frame(&read_n(&mut stream, 12)).unwrap();
    assert_eq!(decoded.frame.id, 0x100);
    assert!(wait_until(Duration::from_secs(1), || bridge.get_stats() == (1, 0, 1)));

    bridge.clear_filters();
    assert_eq!(bridge.filter_count(), 0);
}

#[test]
fn test_host_frames_are_transmitted() {
    let (driver, manager, bridge) = setup(any_port());
    bridge.start(4, 5, 500_000).unwrap();
    let mut stream = connect(&bridge);
    assert!(wait_until(Duration::from_secs(2), || manager.counts().active == 1));

    let frame = CanFrame::new_standard(0x7DF, &[0x02, 0x01, 0x00]).unwrap();
    stream.write_all(&encode_build_frame(&frame, 0)).unwrap();

    assert!(wait_until(Duration::from_secs(2), || driver.transmitted().len() == 1));
    let sent = driver.transmitted()[0];
    assert_eq!(sent.id, 0x7DF);
    assert_eq!(sent.data_slice(), &[0x02, 0x01, 0x00]);
    assert!(wait_until(Duration::from_secs(1), || bridge.get_stats().1 == 1));
}

#[test]
fn test_second_client_is_refused() {
    let (_driver, manager, bridge) = setup(any_port());
    bridge.start(4, 5, 500_000).unwrap();
    let mut first = connect(&bridge);
    assert!(wait_until(Duration::from_secs(2), || manager.counts().active == 1));

    let mut second = connect(&bridge);
    let mut buf = [0u8; 1];
    match second.read(&mut buf) {
        Ok(n) => assert_eq!(n, 0, "extra connection must be closed"),
        Err(e) => assert_ne!(e.kind(), std::io::ErrorKind::WouldBlock, "extra connection left open"),
    }

    first.write_all(&[0xF1, 0x09]).unwrap();
    assert_eq!(read_n(&mut first, 4), vec![0xF1, 0x09, 0xDE, 0xAD]);
}

#[test]
fn test_stop_with_connected_client() {
    let (driver, manager, bridge) = setup(any_port());
    bridge.start(4, 5, 250_000).unwrap();
    let _stream = connect(&bridge);
    assert!(wait_until(Duration::from_secs(2), || manager.counts().active == 1));

    bridge.stop();
    assert_eq!(manager.counts(), Default::default());
    assert!(!driver.is_installed());
    assert_eq!(bridge.get_stats(), (0, 0, 0));
    // 比特率保留到下次 start
    assert_eq!(bridge.get_bitrate(), 250_000);
}

/// 停止后监听端口立即释放，可以在同一端口重新启动
#[test]
#[serial]
fn test_restart_on_fixed_port() {
    let addr = SocketAddr::from(([127, 0, 0, 1], 23_523));
    let (_driver, manager, bridge) = setup(addr);
    bridge.start(4, 5, 500_000).unwrap();
    assert_eq!(bridge.local_addr(), Some(addr));
    let first_client = bridge.client_id();

    // 运行中再次 start：先停止再启动
    bridge.start(4, 5, 1_000_000).unwrap();
    assert_eq!(manager.counts().registered, 1);
    assert_ne!(bridge.client_id(), first_client);
    assert_eq!(bridge.get_bitrate(), 1_000_000);

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream.write_all(&[0xF1, 0x0C]).unwrap();
    assert_eq!(read_n(&mut stream, 3), vec![0xF1, 0x0C, 0x01]);
}

#[test]
#[serial]
fn test_port_in_use_fails_start() {
    let addr = SocketAddr::from(([127, 0, 0, 1], 23_524));
    let _holder = std::net::TcpListener::bind(addr).unwrap();
    let (_driver, manager, bridge) = setup(addr);

    assert!(bridge.start(4, 5, 500_000).is_err());
    assert!(!bridge.is_running());
    assert_eq!(manager.counts().registered, 0);
}
