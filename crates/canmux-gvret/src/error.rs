//! GVRET 桥接错误类型

use canmux_manager::{ErrorKind, ManagerError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GvretError {
    /// 监听套接字 / TCP 任务线程创建失败
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Manager error: {0}")]
    Manager(#[from] ManagerError),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl GvretError {
    /// 映射到管理器的错误分类（IO 错误归为资源不足）
    pub fn kind(&self) -> ErrorKind {
        match self {
            GvretError::Io(_) => ErrorKind::Resource,
            GvretError::Manager(e) => e.kind(),
            GvretError::InvalidState(_) => ErrorKind::InvalidState,
        }
    }
}
