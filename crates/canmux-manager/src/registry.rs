//! 客户端注册表
//!
//! 计数（已注册 / 活跃 / 活跃 TX）由内容实时推导，不单独维护，因此总是一致：
//! `active_tx <= active <= registered`。

use std::collections::HashMap;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::client::{ClientId, ClientMode, ClientRecord, ClientShared};
use crate::error::ManagerError;

/// 客户端表容量
pub const MAX_CLIENTS: usize = 64;

/// 注册表计数快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistrySnapshot {
    pub registered: usize,
    pub active: usize,
    pub active_tx: usize,
}

/// 分发目标列表（通常只有少数几个客户端）
pub(crate) type RxTargets = SmallVec<[(ClientId, Arc<ClientShared>); 8]>;

#[derive(Debug)]
pub(crate) struct ClientRegistry {
    clients: HashMap<ClientId, ClientRecord>,
    /// 下一个候选 ID，0 保留为无效 ID
    next_id: u32,
    capacity: usize,
}

impl ClientRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_id: 1,
            capacity,
        }
    }

    /// 生成唯一 Client ID
    ///
    /// 策略：单调递增，溢出后从 1 重新开始（跳过 0），跳过仍在表中的 ID。
    /// 表容量远小于 ID 空间，循环必然终止。
    fn generate_client_id(&mut self) -> ClientId {
        loop {
            let raw = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if let Some(id) = ClientId::new(raw)
                && !self.clients.contains_key(&id)
            {
                return id;
            }
        }
    }

    /// 注册新客户端（不活跃）
    pub fn insert(&mut self, mode: ClientMode) -> Result<ClientId, ManagerError> {
        if self.clients.len() >= self.capacity {
            return Err(ManagerError::Resource(self.capacity));
        }
        let id = self.generate_client_id();
        self.clients.insert(id, ClientRecord::new(mode));
        Ok(id)
    }

    pub fn get(&self, id: ClientId) -> Option<&ClientRecord> {
        self.clients.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut ClientRecord> {
        self.clients.get_mut(&id)
    }

    pub fn remove(&mut self, id: ClientId) -> Option<ClientRecord> {
        self.clients.remove(&id)
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn counts(&self) -> RegistrySnapshot {
        let mut snapshot = RegistrySnapshot {
            registered: self.clients.len(),
            ..Default::default()
        };
        for record in self.clients.values().filter(|r| r.active) {
            snapshot.active += 1;
            if record.mode == ClientMode::TxEnabled {
                snapshot.active_tx += 1;
            }
        }
        snapshot
    }

    /// 除 `except` 以外的活跃 TX 客户端数
    pub fn other_active_tx(&self, except: ClientId) -> usize {
        self.clients
            .iter()
            .filter(|(id, r)| **id != except && r.active && r.mode == ClientMode::TxEnabled)
            .count()
    }

    /// 当前应收到帧的客户端（按 ID 排序，保证分发顺序稳定）
    pub fn rx_targets(&self) -> RxTargets {
        let mut targets: RxTargets = self
            .clients
            .iter()
            .filter(|(_, r)| r.is_rx_target())
            .map(|(id, r)| (*id, r.shared.clone()))
            .collect();
        targets.sort_unstable_by_key(|(id, _)| *id);
        targets
    }

    /// 全部失活，返回此前活跃的数量
    pub fn deactivate_all(&mut self) -> usize {
        let mut count = 0;
        for record in self.clients.values_mut().filter(|r| r.active) {
            record.active = false;
            count += 1;
        }
        count
    }
}
