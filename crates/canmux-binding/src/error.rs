//! 绑定层错误类型定义

use canmux_manager::{ErrorKind, ManagerError};
use thiserror::Error;

/// 绑定层错误类型
///
/// 消息文本即宿主看到的异常文本。
#[derive(Error, Debug)]
pub enum BindingError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    NotSupported(String),

    #[error("Operation timeout")]
    Timeout,

    #[error("{0}")]
    BusOff(String),

    #[error("{0}")]
    NoAck(String),

    #[error("Manager error: {0}")]
    Manager(#[from] ManagerError),
}

impl BindingError {
    /// 统一错误码（与管理器一致）
    pub fn kind(&self) -> ErrorKind {
        match self {
            BindingError::InvalidArgument(_) => ErrorKind::InvalidArg,
            BindingError::InvalidState(_) | BindingError::NotSupported(_) => ErrorKind::InvalidState,
            BindingError::Timeout => ErrorKind::Timeout,
            BindingError::BusOff(_) => ErrorKind::BusOff,
            BindingError::NoAck(_) => ErrorKind::NoAck,
            BindingError::Manager(e) => e.kind(),
        }
    }

    pub(crate) fn not_initialized() -> Self {
        BindingError::InvalidState("Device is not initialized".into())
    }
}
