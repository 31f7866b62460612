//! # canmux 脚本绑定
//!
//! 把共享 CAN 总线呈现为脚本宿主中的一个对象：
//! - `send` / `recv`（每个绑定一个有界接收队列）
//! - 验收滤波器设置（原始寄存器值或按地址编码）
//! - bus-off 恢复、状态和计数器查询
//! - 告警任务：把控制器告警转换为宿主回调（经 [`HostScheduler`](canmux_manager::HostScheduler) 投递）
//! - 模块级原始客户端接口 [`RawCan`]：直接使用管理器句柄，接收回调在宿主线程上交付

mod alert;
mod bus;
mod error;
pub mod options;
pub mod raw;

pub use alert::ALERT_THREAD_NAME;
pub use bus::CanBus;
pub use error::BindingError;
pub use options::{
    BindingState, CanInfo, CanMode, CanOptions, DEFAULT_RECV_TIMEOUT, DEFAULT_RX_QUEUE, DEFAULT_SEND_TIMEOUT,
    FilterMode, ReceivedFrame, SendOptions, encode_filter,
};
pub use raw::{RAW_RX_QUEUE_LEN, RawCan, RawFrame, RawRxCallback};
