//! 特征图内存账本.

use std::sync::atomic::{AtomicUsize, Ordering};

/// 特征图内存账本. 记录经由它创建的、目前仍存活的特征图个数与字节数.
///
/// 每个 [`super::FeatureMap`] 创建时向账本登记, 释放 (drop) 时注销,
/// 因此 "每个中间结果都被释放恰好一次" 可以直接由账本观测:
/// 前向传播结束后, 账本中应只剩下调用者持有的那些特征图.
///
/// 账本可被多个线程共享 (原子计数).
#[derive(Debug, Default)]
pub struct MemoryLedger {
    live_maps: AtomicUsize,
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    allocations: AtomicUsize,
}

impl MemoryLedger {
    /// 创建空账本.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一块新分配的特征图存储.
    pub(crate) fn register(&self, bytes: usize) {
        self.live_maps.fetch_add(1, Ordering::AcqRel);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        let now = self.live_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.peak_bytes.fetch_max(now, Ordering::AcqRel);
    }

    /// 注销一块特征图存储.
    pub(crate) fn release(&self, bytes: usize) {
        let prev = self.live_maps.fetch_sub(1, Ordering::AcqRel);
        debug_assert_ne!(prev, 0, "ledger released more maps than registered");
        self.live_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// 目前存活的特征图个数.
    #[inline]
    pub fn live_maps(&self) -> usize {
        self.live_maps.load(Ordering::Acquire)
    }

    /// 目前存活的特征图字节数.
    #[inline]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }

    /// 存活字节数的历史峰值.
    #[inline]
    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes.load(Ordering::Acquire)
    }

    /// 累计分配次数.
    #[inline]
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    /// 获取当前账本状态的快照.
    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            live_maps: self.live_maps(),
            live_bytes: self.live_bytes(),
            peak_bytes: self.peak_bytes(),
            allocations: self.allocations(),
        }
    }
}

/// [`MemoryLedger`] 在某一时刻的只读快照.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LedgerSnapshot {
    /// 存活的特征图个数.
    pub live_maps: usize,

    /// 存活的特征图字节数.
    pub live_bytes: usize,

    /// 存活字节数峰值.
    pub peak_bytes: usize,

    /// 累计分配次数.
    pub allocations: usize,
}

impl LedgerSnapshot {
    /// 与更早的快照 `baseline` 相比, 存活的特征图个数与字节数是否回到了原值.
    #[inline]
    pub fn is_balanced_with(&self, baseline: &LedgerSnapshot) -> bool {
        self.live_maps == baseline.live_maps && self.live_bytes == baseline.live_bytes
    }

    /// 相对 `baseline` 泄漏 (或多释放) 的字节数. 正数代表泄漏.
    #[inline]
    pub fn leaked_bytes_since(&self, baseline: &LedgerSnapshot) -> isize {
        self.live_bytes as isize - baseline.live_bytes as isize
    }

    /// 自 `baseline` 以来新增的分配次数.
    #[inline]
    pub fn allocations_since(&self, baseline: &LedgerSnapshot) -> usize {
        self.allocations - baseline.allocations
    }
}
