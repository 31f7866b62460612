//! 出站包环形缓冲
//!
//! 按字节计预算的有界队列：生产者是 RX 分发回调，消费者是 TCP 任务。
//! 一个包要么整体入队，要么整体丢弃，消费者总是拿到完整的包。

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::protocol::Packet;

/// 默认容量（字节）
pub const DEFAULT_RING_CAPACITY: usize = 8 * 1024;

struct Inner {
    packets: VecDeque<Packet>,
    used: usize,
}

pub struct FrameRing {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl FrameRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                packets: VecDeque::new(),
                used: 0,
            }),
        }
    }

    /// 入队一个包，空间不足时返回 `false`（包被丢弃）
    pub fn push(&self, packet: Packet) -> bool {
        let mut inner = self.inner.lock();
        if inner.used + packet.len() > self.capacity {
            return false;
        }
        inner.used += packet.len();
        inner.packets.push_back(packet);
        true
    }

    pub fn pop(&self) -> Option<Packet> {
        let mut inner = self.inner.lock();
        let packet = inner.packets.pop_front()?;
        inner.used -= packet.len();
        Some(packet)
    }

    /// 丢弃全部包，返回丢弃的个数
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.packets.len();
        inner.packets.clear();
        inner.used = 0;
        count
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().packets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().packets.len()
    }

    /// 已占用字节数
    pub fn used_bytes(&self) -> usize {
        self.inner.lock().used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for FrameRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRing")
            .field("capacity", &self.capacity)
            .field("used", &self.used_bytes())
            .finish()
    }
}
