//! 驱动门面错误类型

use thiserror::Error;

use crate::frame::ProtocolError;

/// 驱动门面统一错误类型
#[derive(Error, Debug)]
pub enum CanError {
    #[error("Driver already installed")]
    AlreadyInstalled,

    #[error("Driver not installed")]
    NotInstalled,

    #[error("Invalid driver config: {0}")]
    InvalidConfig(String),

    #[error("Out of resources")]
    NoResources,

    #[error("Driver busy (running)")]
    Busy,

    #[error("Bus off")]
    BusOff,

    #[error("Driver not running")]
    NotRunning,

    #[error("Operation timed out")]
    Timeout,

    #[error("No acknowledgement on the bus")]
    NoAck,

    #[error("Controller is not in bus-off state")]
    NotBusOff,

    #[error("Operation not supported in current mode")]
    NotSupported,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    /// 不可恢复错误（设备消失等），需要重新初始化
    #[error("Fatal driver error: {0}")]
    Fatal(String),
}

impl CanError {
    /// 是否为不可恢复错误
    pub fn is_fatal(&self) -> bool {
        match self {
            CanError::Fatal(_) => true,
            CanError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

impl From<ProtocolError> for CanError {
    fn from(e: ProtocolError) -> Self {
        CanError::InvalidArgument(e.to_string())
    }
}
