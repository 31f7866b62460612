//! 桥接程序配置
//!
//! 可选 TOML 配置文件提供默认值，命令行参数覆盖文件中的同名项。
//!
//! ```toml
//! interface = "can0"
//! bind = "0.0.0.0:23"
//! bitrate = 500000
//! tx_pin = 4
//! rx_pin = 5
//!
//! [[filters]]
//! id = 0x7E8
//! mask = 0x7F8
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use canmux_can::TimingConfig;
use canmux_gvret::{DEFAULT_RING_CAPACITY, MAX_FILTERS};
use serde::Deserialize;

use crate::Args;

pub const DEFAULT_INTERFACE: &str = "can0";
pub const DEFAULT_BITRATE: u32 = 500_000;
pub const DEFAULT_TX_PIN: u8 = 4;
pub const DEFAULT_RX_PIN: u8 = 5;

/// GVRET 软件过滤器（`ID:MASK[:ext]`，数值可用 `0x` 十六进制）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FilterSpec {
    pub id: u32,
    pub mask: u32,
    #[serde(default)]
    pub extended: bool,
}

fn parse_number(text: &str) -> Result<u32, String> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", text, e))
}

impl FromStr for FilterSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let extended = match parts.as_slice() {
            [_, _] => false,
            [_, _, "ext"] => true,
            [_, _, "std"] => false,
            _ => return Err(format!("expected ID:MASK[:ext], got '{}'", s)),
        };
        Ok(Self {
            id: parse_number(parts[0])?,
            mask: parse_number(parts[1])?,
            extended,
        })
    }
}

impl fmt::Display for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}:0x{:X}", self.id, self.mask)?;
        if self.extended {
            f.write_str(":ext")?;
        }
        Ok(())
    }
}

/// 配置文件内容（所有项可选）
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub interface: Option<String>,
    #[serde(rename = "virtual")]
    pub virtual_bus: Option<bool>,
    pub bind: Option<SocketAddr>,
    pub bitrate: Option<u32>,
    pub tx_pin: Option<u8>,
    pub rx_pin: Option<u8>,
    pub ring_capacity: Option<usize>,
    pub filters: Vec<FilterSpec>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// CAN 后端
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    SocketCan(String),
    Virtual,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::SocketCan(iface) => write!(f, "socketcan:{}", iface),
            Backend::Virtual => f.write_str("virtual"),
        }
    }
}

/// 合并后的最终设置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSettings {
    pub backend: Backend,
    pub bind: SocketAddr,
    pub bitrate: u32,
    pub tx_pin: u8,
    pub rx_pin: u8,
    pub ring_capacity: usize,
    pub filters: Vec<FilterSpec>,
}

impl BridgeSettings {
    pub fn resolve(args: &Args, file: FileConfig) -> Result<Self> {
        let backend = if args.virtual_bus {
            Backend::Virtual
        } else if let Some(iface) = &args.interface {
            Backend::SocketCan(iface.clone())
        } else if file.virtual_bus == Some(true) {
            Backend::Virtual
        } else {
            Backend::SocketCan(file.interface.unwrap_or_else(|| DEFAULT_INTERFACE.to_string()))
        };

        let bitrate = args.bitrate.or(file.bitrate).unwrap_or(DEFAULT_BITRATE);
        if TimingConfig::from_bitrate(bitrate).is_none() {
            bail!("unsupported bitrate {} bit/s", bitrate);
        }

        let filters = if args.filters.is_empty() {
            file.filters
        } else {
            args.filters.clone()
        };
        if filters.len() > MAX_FILTERS {
            bail!("at most {} filters are supported, got {}", MAX_FILTERS, filters.len());
        }

        let ring_capacity = file.ring_capacity.unwrap_or(DEFAULT_RING_CAPACITY);
        if ring_capacity < 64 {
            bail!("ring_capacity {} is too small", ring_capacity);
        }

        Ok(Self {
            backend,
            bind: args
                .bind
                .or(file.bind)
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], canmux_gvret::protocol::DEFAULT_PORT))),
            bitrate,
            tx_pin: args.tx_pin.or(file.tx_pin).unwrap_or(DEFAULT_TX_PIN),
            rx_pin: args.rx_pin.or(file.rx_pin).unwrap_or(DEFAULT_RX_PIN),
            ring_capacity,
            filters,
        })
    }
}
