// 并发控制模块
//
// 多模型引擎的并发控制核心，包括：
// - 可锁资源与锁管理（共享锁/排他锁、升级、阻塞等待）
// - 两种可插拔的死锁检测策略（全局等待图 / 按资源请求序列）
// - 多版本可见性（MVCC 版本链与快照读）
// - 保留版本标识符校验
// - 事务生命周期管理

pub mod deadlock;
pub mod identifier;
pub mod locks;
pub mod transaction;
pub mod version_store;

pub use deadlock::{
    DeadlockDetector, DetectorStats, GraphDetector, RequestSequenceDetector,
};
pub use identifier::{
    check_field_names, check_identifier, check_properties, RESERVED_VERSION_KEY,
};
pub use locks::{LockManager, LockManagerStats, LockType, LockableKey};
pub use transaction::{
    Transaction, TransactionError, TransactionManager, TransactionResult,
    TransactionStatus, WriteRecord,
};
pub use version_store::{EntryId, Version, VersionStore, VersionStoreStats};

use crate::catalog::ConcurrencyMode;

/// 事务ID
pub type TxId = u64;

/// 事务序列号（事务开始时原子分配，决定 MVCC 快照顺序）
pub type SeqNo = u64;

/// 死锁检测策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorStrategy {
    /// 全局等待图：只惩罚闭合环的最新请求者
    Graph,
    /// 按资源请求序列：环中所有事务都是候选受害者
    RequestSequence,
}

impl Default for DetectorStrategy {
    fn default() -> Self {
        Self::Graph
    }
}

/// 事务配置
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// 进程级默认并发控制模式（命名空间未指定时使用）
    pub default_mode: ConcurrencyMode,
    /// 安装的死锁检测策略
    pub detector: DetectorStrategy,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            default_mode: ConcurrencyMode::Mvcc,
            detector: DetectorStrategy::Graph,
        }
    }
}

impl TransactionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_mode(mut self, mode: ConcurrencyMode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn with_detector(mut self, detector: DetectorStrategy) -> Self {
        self.detector = detector;
        self
    }
}
