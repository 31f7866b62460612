//! CAN 2.0 帧类型

use thiserror::Error;

/// 标准帧 ID 掩码（11 bit）
pub const STANDARD_ID_MASK: u32 = 0x7FF;

/// 扩展帧 ID 掩码（29 bit）
pub const EXTENDED_ID_MASK: u32 = 0x1FFF_FFFF;

/// CAN 2.0 最大数据长度
pub const MAX_DATA_LEN: usize = 8;

/// CAN 2.0 帧
///
/// 驱动门面、管理器和各客户端之间传递的唯一帧类型。
///
/// # 设计特性
///
/// - **Copy trait**：固定 8 字节数据，无堆分配
/// - **ID 截断**：构造时按帧类型截断 ID（标准帧 11 bit，扩展帧 29 bit），高位静默丢弃
/// - **标志位**：`is_remote`（RTR）和 `self_reception`（自收，发送时让控制器把帧回送到本机 RX）
///
/// # 限制
///
/// - **仅支持 CAN 2.0**：不支持 CAN FD
///
/// # 示例
///
/// ```rust
/// use canmux_can::CanFrame;
///
/// let frame = CanFrame::new_standard(0x123, &[1, 2, 3, 4]).unwrap();
/// assert_eq!(frame.id, 0x123);
/// assert_eq!(frame.data_slice(), &[1, 2, 3, 4]);
///
/// // 超出 11 bit 的部分被截断
/// let frame = CanFrame::new_standard(0xFFFF, &[]).unwrap();
/// assert_eq!(frame.id, 0x7FF);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CanFrame {
    /// CAN ID（已按帧类型截断）
    pub id: u32,

    /// 帧数据（固定 8 字节，未使用部分为 0）
    pub data: [u8; 8],

    /// 有效数据长度 (0-8)
    pub len: u8,

    /// 是否为扩展帧（29-bit ID）
    pub is_extended: bool,

    /// 远程帧（RTR）
    pub is_remote: bool,

    /// 发送时请求自收
    pub self_reception: bool,

    /// 接收时间戳（微秒），0 表示不可用
    pub timestamp_us: u64,
}

/// 帧构造错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid frame length: expected at most {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid DLC for remote frame: {dlc}")]
    InvalidDlc { dlc: u8 },
}

impl CanFrame {
    /// 创建标准帧
    pub fn new_standard(id: u32, data: &[u8]) -> Result<Self, ProtocolError> {
        Self::new(id, data, false)
    }

    /// 创建扩展帧
    pub fn new_extended(id: u32, data: &[u8]) -> Result<Self, ProtocolError> {
        Self::new(id, data, true)
    }

    /// 通用构造器
    ///
    /// 数据超过 8 字节返回 `ProtocolError::InvalidLength`；ID 按帧类型截断。
    pub fn new(id: u32, data: &[u8], is_extended: bool) -> Result<Self, ProtocolError> {
        if data.len() > MAX_DATA_LEN {
            return Err(ProtocolError::InvalidLength {
                expected: MAX_DATA_LEN,
                actual: data.len(),
            });
        }

        let mut fixed_data = [0u8; 8];
        fixed_data[..data.len()].copy_from_slice(data);

        Ok(Self {
            id: mask_id(id, is_extended),
            data: fixed_data,
            len: data.len() as u8,
            is_extended,
            is_remote: false,
            self_reception: false,
            timestamp_us: 0,
        })
    }

    /// 创建远程帧（RTR），`dlc` 为请求的数据长度
    pub fn new_remote(id: u32, dlc: u8, is_extended: bool) -> Result<Self, ProtocolError> {
        if dlc as usize > MAX_DATA_LEN {
            return Err(ProtocolError::InvalidDlc { dlc });
        }

        Ok(Self {
            id: mask_id(id, is_extended),
            len: dlc,
            is_extended,
            is_remote: true,
            ..Self::default()
        })
    }

    /// 设置自收标志
    pub fn with_self_reception(mut self, enabled: bool) -> Self {
        self.self_reception = enabled;
        self
    }

    /// 设置接收时间戳
    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    /// 获取数据切片（只包含有效数据；远程帧为空）
    pub fn data_slice(&self) -> &[u8] {
        if self.is_remote {
            &[]
        } else {
            &self.data[..self.len as usize]
        }
    }

    /// 数据长度码
    pub fn dlc(&self) -> u8 {
        self.len
    }
}

/// 按帧类型截断 CAN ID
#[inline]
pub fn mask_id(id: u32, is_extended: bool) -> u32 {
    if is_extended {
        id & EXTENDED_ID_MASK
    } else {
        id & STANDARD_ID_MASK
    }
}
