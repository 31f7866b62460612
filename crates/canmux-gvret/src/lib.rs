//! # canmux GVRET 桥接
//!
//! 通过 TCP 把共享 CAN 总线暴露给 SavvyCAN（GVRET 二进制协议）。
//!
//! - [`protocol`]：命令码、响应编码、出站帧编码
//! - [`parser`]：入站字节流状态机
//! - [`GvretBridge`]：管理器客户端 + `mio` TCP 任务
//!
//! 没有 TCP 客户端连接时桥接只注册不激活，不会扰动总线。

mod bridge;
mod error;
pub mod filter;
pub mod parser;
pub mod protocol;
pub mod ring;
mod server;
mod stats;

pub use bridge::{GvretBridge, GvretConfig};
pub use error::GvretError;
pub use filter::{MAX_FILTERS, SoftwareFilter, SoftwareFilters};
pub use parser::Parser;
pub use protocol::{BusSetup, Command, DecodedFrame, Packet};
pub use ring::{DEFAULT_RING_CAPACITY, FrameRing};
pub use server::TCP_THREAD_NAME;
pub use stats::GvretStatsSnapshot;
