//! canmux-bridge：GVRET / SavvyCAN TCP 桥接主入口
//!
//! 在一个 SocketCAN 接口（或内存虚拟控制器）上运行共享总线管理器和 GVRET 桥接。
//! 本进程的主线程充当脚本宿主：执行桥接投递的回调（例如 SavvyCAN 请求的比特率变更）。

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use canmux_can::{CanDriver, MockCanDriver, TimingConfig};
use canmux_gvret::{GvretBridge, GvretConfig};
use canmux_manager::{BusSettings, CanManager, HostScheduler, ManagerConfig};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::{Backend, BridgeSettings, FileConfig, FilterSpec};

/// 主循环等待宿主回调的单次时长
const HOST_POLL: Duration = Duration::from_millis(200);

/// 统计输出间隔
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// GVRET / SavvyCAN TCP bridge
///
/// 客户端连接前不激活总线；连接后收发帧，断开后总线停止。
#[derive(Parser, Debug)]
#[command(name = "canmux-bridge")]
#[command(about = "GVRET/SavvyCAN TCP bridge over a shared CAN bus", long_about = None)]
pub struct Args {
    /// TOML 配置文件（命令行参数优先）
    #[arg(long)]
    config: Option<PathBuf>,

    /// SocketCAN 接口名称（默认: can0）
    #[arg(long, conflicts_with = "virtual_bus")]
    interface: Option<String>,

    /// 使用内存虚拟控制器（无需硬件）
    #[arg(long = "virtual")]
    virtual_bus: bool,

    /// TCP 监听地址（默认: 0.0.0.0:23）
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// CAN 波特率（默认: 500000）
    #[arg(long)]
    bitrate: Option<u32>,

    /// 收发器 TX 引脚（仅记录）
    #[arg(long)]
    tx_pin: Option<u8>,

    /// 收发器 RX 引脚（仅记录）
    #[arg(long)]
    rx_pin: Option<u8>,

    /// GVRET 软件过滤器，可重复
    #[arg(long = "filter", value_name = "ID:MASK[:ext]")]
    filters: Vec<FilterSpec>,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("canmux=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        },
    }
}

fn run(args: Args) -> Result<()> {
    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let settings = BridgeSettings::resolve(&args, file)?;

    let driver = open_driver(&settings.backend)?;
    let timing = TimingConfig::from_bitrate(settings.bitrate)
        .with_context(|| format!("unsupported bitrate {}", settings.bitrate))?;
    let bus = BusSettings {
        timing,
        ..BusSettings::default()
    };
    let manager = Arc::new(CanManager::with_config(driver, bus, ManagerConfig::default()));
    let host = HostScheduler::default();

    let bridge = GvretBridge::new(
        manager.clone(),
        host.clone(),
        GvretConfig {
            bind_addr: settings.bind,
            ring_capacity: settings.ring_capacity,
            ..GvretConfig::default()
        },
    );
    for filter in &settings.filters {
        bridge.add_filter(filter.id, filter.mask, filter.extended);
    }
    let hook_manager = Arc::downgrade(&manager);
    bridge.set_bitrate_change_callback(Some(Arc::new(move |bitrate: i32| apply_bitrate(&hook_manager, bitrate))));

    bridge
        .start(settings.tx_pin, settings.rx_pin, settings.bitrate)
        .context("failed to start GVRET bridge")?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst)).context("failed to set signal handler")?;

    info!(
        "canmux-bridge ready: backend={}, bind={}, bitrate={}, filters={}. Press Ctrl+C to stop.",
        settings.backend,
        settings.bind,
        settings.bitrate,
        settings.filters.len()
    );

    let mut last_report = Instant::now();
    while running.load(Ordering::SeqCst) {
        host.run_one(HOST_POLL);
        if last_report.elapsed() >= STATS_INTERVAL {
            let (rx, tx, dropped) = bridge.get_stats();
            info!("GVRET stats: rx={}, tx={}, dropped={}", rx, tx, dropped);
            last_report = Instant::now();
        }
    }

    info!("Received interrupt signal, shutting down");
    bridge.stop();
    Ok(())
}

fn open_driver(backend: &Backend) -> Result<Arc<dyn CanDriver>> {
    match backend {
        Backend::Virtual => {
            info!("Using the virtual CAN controller");
            Ok(Arc::new(MockCanDriver::new()))
        },
        #[cfg(target_os = "linux")]
        Backend::SocketCan(iface) => Ok(Arc::new(canmux_can::SocketCanDriver::new(iface.clone()))),
        #[cfg(not(target_os = "linux"))]
        Backend::SocketCan(iface) => {
            anyhow::bail!("SocketCAN interface '{}' is only available on Linux; use --virtual", iface)
        },
    }
}

/// SavvyCAN 请求新比特率：更新总线时序（总线下次安装时生效）
fn apply_bitrate(manager: &Weak<CanManager>, bitrate: i32) {
    let Some(manager) = manager.upgrade() else {
        return;
    };
    let Some(timing) = u32::try_from(bitrate).ok().and_then(TimingConfig::from_bitrate) else {
        warn!("Unsupported bitrate {} requested by GVRET client", bitrate);
        return;
    };
    match manager.set_timing(timing) {
        Ok(()) => info!("Bus timing updated to {} bit/s", bitrate),
        Err(e) => warn!("Failed to apply bitrate {}: {}", bitrate, e),
    }
}
