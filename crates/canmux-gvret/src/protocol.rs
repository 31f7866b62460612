//! GVRET 二进制协议
//!
//! 所有命令以 `0xF1` 开头，后跟命令字节和固定长度负载；多字节整数为小端序。
//!
//! # 出站帧格式
//!
//! ```text
//! F1 00 | ts[0..4] (µs, LE) | id[0..4] (LE, bit 31 = 扩展帧) | (bus << 4) | dlc | data[dlc]
//! ```
//!
//! 出站帧没有校验和字节（SavvyCAN 按已知长度读取）。

use canmux_can::CanFrame;
use smallvec::SmallVec;

/// 命令起始字节
pub const START_BYTE: u8 = 0xF1;

/// 二进制模式选择字节（服务端始终处于二进制模式，收到后忽略）
pub const BINARY_MODE_BYTE: u8 = 0xE7;

/// 默认 TCP 端口
pub const DEFAULT_PORT: u16 = 23;

/// GET_DEV_INFO 上报的固件构建号
pub const BUILD_NUMBER: u16 = 1;

/// GET_DEV_INFO 上报的 EEPROM 版本
pub const EEPROM_VERSION: u8 = 0x20;

/// ID 字段中的扩展帧标志位
pub const EXTENDED_FLAG: u32 = 0x8000_0000;

/// 命令字节
pub mod cmd {
    pub const BUILD_CAN_FRAME: u8 = 0x00;
    pub const TIME_SYNC: u8 = 0x01;
    pub const DIG_INPUTS: u8 = 0x02;
    pub const ANA_INPUTS: u8 = 0x03;
    pub const SET_DIG_OUT: u8 = 0x04;
    pub const SETUP_CANBUS: u8 = 0x05;
    pub const GET_CANBUS_PARAMS: u8 = 0x06;
    pub const GET_DEV_INFO: u8 = 0x07;
    pub const SET_SW_MODE: u8 = 0x08;
    pub const KEEPALIVE: u8 = 0x09;
    pub const SET_SYSTYPE: u8 = 0x0A;
    pub const ECHO_CAN_FRAME: u8 = 0x0B;
    pub const GET_NUMBUSES: u8 = 0x0C;
    pub const GET_EXT_BUSES: u8 = 0x0D;
    pub const SET_EXT_BUSES: u8 = 0x0E;
}

/// 一个完整的出站包（最长的是 19 字节的 8 字节数据帧）
pub type Packet = SmallVec<[u8; 20]>;

/// SETUP_CANBUS 中 CAN0 的配置字
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusSetup(pub u32);

impl BusSetup {
    const VALID: u32 = 1 << 31;
    const ENABLED: u32 = 1 << 30;
    const LISTEN_ONLY: u32 = 1 << 29;
    const BITRATE_MASK: u32 = 0x0FFF_FFFF;

    /// 配置字有效（bit 31），无效时整条命令被忽略
    pub fn is_valid(self) -> bool {
        self.0 & Self::VALID != 0
    }

    pub fn is_enabled(self) -> bool {
        self.0 & Self::ENABLED != 0
    }

    pub fn is_listen_only(self) -> bool {
        self.0 & Self::LISTEN_ONLY != 0
    }

    pub fn bitrate(self) -> u32 {
        self.0 & Self::BITRATE_MASK
    }
}

/// 解析器产出的完整命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// 主机请求发送一帧
    BuildCanFrame { bus: u8, frame: CanFrame },
    TimeSync,
    SetupCanbus(BusSetup),
    GetCanbusParams,
    GetDevInfo,
    Keepalive,
    GetNumBuses,
    GetExtBuses,
    SetExtBuses,
}

fn packet(bytes: &[u8]) -> Packet {
    SmallVec::from_slice(bytes)
}

pub fn dev_info() -> Packet {
    let [lo, hi] = BUILD_NUMBER.to_le_bytes();
    packet(&[START_BYTE, cmd::GET_DEV_INFO, lo, hi, EEPROM_VERSION, 0, 0, 0])
}

pub fn num_buses() -> Packet {
    packet(&[START_BYTE, cmd::GET_NUMBUSES, 1])
}

/// CAN0 启用 + 当前比特率；CAN1 全零
pub fn canbus_params(bitrate: u32) -> Packet {
    let mut out = packet(&[START_BYTE, cmd::GET_CANBUS_PARAMS, 1]);
    out.extend_from_slice(&bitrate.to_le_bytes());
    out.extend_from_slice(&[0; 5]);
    out
}

pub fn ext_buses() -> Packet {
    let mut out = packet(&[START_BYTE, cmd::GET_EXT_BUSES]);
    out.extend_from_slice(&[0; 15]);
    out
}

pub fn keepalive() -> Packet {
    packet(&[START_BYTE, cmd::KEEPALIVE, 0xDE, 0xAD])
}

pub fn time_sync(timestamp_us: u32) -> Packet {
    let mut out = packet(&[START_BYTE, cmd::TIME_SYNC]);
    out.extend_from_slice(&timestamp_us.to_le_bytes());
    out
}

/// 编码一个接收到的帧；远程帧不转发，返回 `None`
pub fn encode_frame(frame: &CanFrame, timestamp_us: u32, bus: u8) -> Option<Packet> {
    if frame.is_remote {
        return None;
    }
    let mut id = frame.id;
    if frame.is_extended {
        id |= EXTENDED_FLAG;
    }
    let mut out = packet(&[START_BYTE, cmd::BUILD_CAN_FRAME]);
    out.extend_from_slice(&timestamp_us.to_le_bytes());
    out.extend_from_slice(&id.to_le_bytes());
    out.push((bus << 4) | (frame.len & 0x0F));
    out.extend_from_slice(frame.data_slice());
    Some(out)
}

/// 出站帧解码结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame {
    pub timestamp_us: u32,
    pub bus: u8,
    pub frame: CanFrame,
}

/// 解码一个出站帧包（主机侧视角），长度不符返回 `None`
pub fn decode_frame(bytes: &[u8]) -> Option<DecodedFrame> {
    if bytes.len() < 11 || bytes[0] != START_BYTE || bytes[1] != cmd::BUILD_CAN_FRAME {
        return None;
    }
    let timestamp_us = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    let raw_id = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
    let bus = bytes[10] >> 4;
    let len = usize::from(bytes[10] & 0x0F);
    let data = bytes.get(11..11 + len)?;
    let frame = CanFrame::new(raw_id & !EXTENDED_FLAG, data, raw_id & EXTENDED_FLAG != 0).ok()?;
    Some(DecodedFrame {
        timestamp_us,
        bus,
        frame,
    })
}

/// 编码一条 BUILD_CAN_FRAME 命令（主机侧视角，校验和填 0）
pub fn encode_build_frame(frame: &CanFrame, bus: u8) -> Packet {
    let mut id = frame.id;
    if frame.is_extended {
        id |= EXTENDED_FLAG;
    }
    let mut out = packet(&[START_BYTE, cmd::BUILD_CAN_FRAME]);
    out.extend_from_slice(&id.to_le_bytes());
    out.push(bus);
    out.push(frame.len);
    out.extend_from_slice(frame.data_slice());
    out.push(0);
    out
}
