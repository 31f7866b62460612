//! 软件接收过滤表

use canmux_can::CanFrame;
use smallvec::SmallVec;

/// 过滤表容量
pub const MAX_FILTERS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftwareFilter {
    pub id: u32,
    pub mask: u32,
    pub extended: bool,
}

impl SoftwareFilter {
    pub fn matches(&self, frame: &CanFrame) -> bool {
        frame.is_extended == self.extended && (frame.id & self.mask) == (self.id & self.mask)
    }
}

/// 过滤表；为空时所有帧通过
#[derive(Debug, Clone, Default)]
pub struct SoftwareFilters {
    entries: SmallVec<[SoftwareFilter; MAX_FILTERS]>,
}

impl SoftwareFilters {
    /// 添加一条过滤器，表满时返回 `false`
    pub fn add(&mut self, filter: SoftwareFilter) -> bool {
        if self.entries.len() >= MAX_FILTERS {
            return false;
        }
        self.entries.push(filter);
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn accepts(&self, frame: &CanFrame) -> bool {
        self.entries.is_empty() || self.entries.iter().any(|f| f.matches(frame))
    }
}
