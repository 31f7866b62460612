//! 管理器错误类型定义

use canmux_can::CanError;
use thiserror::Error;

/// 错误分类（对外的稳定错误码）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArg,
    InvalidState,
    Busy,
    Timeout,
    BusOff,
    NoAck,
    Resource,
    Fatal,
    BusUnavailable,
}

/// 管理器错误类型
#[derive(Error, Debug)]
pub enum ManagerError {
    /// 客户端请求参数错误（未知 ID、DLC > 8 等），不改变总线状态
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// 当前状态不允许该操作
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Bus busy")]
    Busy,

    #[error("Operation timeout")]
    Timeout,

    #[error("Bus off")]
    BusOff,

    #[error("No acknowledgement on the bus")]
    NoAck,

    /// 客户端表已满
    #[error("Client table full ({0} clients)")]
    Resource(usize),

    /// 调和失败，总线保持停止/卸载
    #[error("Bus unavailable: {0}")]
    BusUnavailable(#[source] CanError),

    /// 驱动不可恢复错误，所有客户端已失活
    #[error("Fatal driver error: {0}")]
    Fatal(String),
}

impl ManagerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ManagerError::InvalidArgument(_) => ErrorKind::InvalidArg,
            ManagerError::InvalidState(_) => ErrorKind::InvalidState,
            ManagerError::Busy => ErrorKind::Busy,
            ManagerError::Timeout => ErrorKind::Timeout,
            ManagerError::BusOff => ErrorKind::BusOff,
            ManagerError::NoAck => ErrorKind::NoAck,
            ManagerError::Resource(_) => ErrorKind::Resource,
            ManagerError::Fatal(_) => ErrorKind::Fatal,
            ManagerError::BusUnavailable(_) => ErrorKind::BusUnavailable,
        }
    }

    pub(crate) fn invalid_arg(msg: impl Into<String>) -> Self {
        ManagerError::InvalidArgument(msg.into())
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        ManagerError::InvalidState(msg.into())
    }
}

/// 驱动错误到管理器错误的映射
///
/// 收发类错误（`Timeout`/`BusOff`/`NoAck`）原样上报；生命周期类错误归为 `InvalidState`。
impl From<CanError> for ManagerError {
    fn from(e: CanError) -> Self {
        if e.is_fatal() {
            return ManagerError::Fatal(e.to_string());
        }
        match e {
            CanError::Timeout => ManagerError::Timeout,
            CanError::BusOff => ManagerError::BusOff,
            CanError::NoAck => ManagerError::NoAck,
            CanError::Busy => ManagerError::Busy,
            CanError::NoResources => ManagerError::Resource(0),
            CanError::InvalidArgument(msg) | CanError::InvalidConfig(msg) => {
                ManagerError::InvalidArgument(msg)
            },
            CanError::NotRunning => ManagerError::invalid_state("driver not running"),
            CanError::NotInstalled => ManagerError::invalid_state("driver not installed"),
            CanError::NotSupported => {
                ManagerError::invalid_state("operation not supported in current bus mode")
            },
            other => ManagerError::InvalidState(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transmit_errors_surface_unchanged() {
        assert_eq!(ManagerError::from(CanError::Timeout).kind(), ErrorKind::Timeout);
        assert_eq!(ManagerError::from(CanError::BusOff).kind(), ErrorKind::BusOff);
        assert_eq!(ManagerError::from(CanError::NoAck).kind(), ErrorKind::NoAck);
    }

    #[test]
    fn test_lifecycle_errors_are_invalid_state() {
        assert_eq!(
            ManagerError::from(CanError::NotRunning).kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            ManagerError::from(CanError::NotSupported).kind(),
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn test_fatal_mapping() {
        let err = ManagerError::from(CanError::Fatal("device removed".into()));
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(err.to_string().contains("device removed"));
    }

    #[test]
    fn test_bus_unavailable_display() {
        let err = ManagerError::BusUnavailable(CanError::NoResources);
        assert_eq!(err.kind(), ErrorKind::BusUnavailable);
        assert!(err.to_string().contains("Out of resources"));
    }
}
