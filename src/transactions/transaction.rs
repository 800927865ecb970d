// 事务生命周期模块
//
// 定义事务本体、错误分类和事务管理器：
// - 事务在开始时原子地获得ID与快照序列号
// - 语句级操作按命名空间的并发控制模式分派
//   （S2PL 走锁管理器，MVCC 走多版本快照）
// - 提交/回滚释放全部持有的锁并清理检测器等待边

use crate::catalog::{Catalog, ConcurrencyMode};
use crate::transactions::deadlock::{DeadlockDetector, GraphDetector, RequestSequenceDetector};
use crate::transactions::identifier::{self, RESERVED_VERSION_KEY};
use crate::transactions::locks::{LockManager, LockType, LockableKey};
use crate::transactions::version_store::{EntryId, VersionStore};
use crate::transactions::{DetectorStrategy, SeqNo, TransactionConfig, TxId};
use crate::values::{Properties, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// 事务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// 活动中
    Active,
    /// 已提交
    Committed,
    /// 已回滚
    RolledBack,
}

/// 事务错误类型
#[derive(Debug)]
pub enum TransactionError {
    /// 事务未找到
    TransactionNotFound(TxId),
    /// 事务已完成
    TransactionAlreadyCompleted(TxId, TransactionStatus),
    /// 被死锁检测器选为受害者而中止
    DeadlockAbort { tx_id: TxId },
    /// MVCC 提交时的写冲突（首个提交者获胜）
    WriteConflict { entry: EntryId },
    /// 语句使用了保留的版本标识符
    ReservedIdentifier { name: String },
    /// 提交约束未通过
    ConstraintViolation,
    /// 命名空间未找到
    NamespaceNotFound(String),
    /// 命名空间已存在
    NamespaceAlreadyExists(String),
    /// 条目不存在或对当前快照不可见
    EntryNotFound(EntryId),
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionError::TransactionNotFound(id) => {
                write!(f, "Transaction {} not found", id)
            }
            TransactionError::TransactionAlreadyCompleted(id, status) => {
                write!(f, "Transaction {} already completed with status {:?}", id, status)
            }
            TransactionError::DeadlockAbort { tx_id } => {
                write!(f, "Transaction {} aborted as deadlock victim", tx_id)
            }
            TransactionError::WriteConflict { entry } => {
                write!(f, "Write conflict on entry {}: first committer wins", entry)
            }
            TransactionError::ReservedIdentifier { name } => {
                write!(f, "Identifier '{}' is reserved for version tracking", name)
            }
            TransactionError::ConstraintViolation => {
                write!(f, "Commit constraint evaluated to false")
            }
            TransactionError::NamespaceNotFound(name) => {
                write!(f, "Namespace '{}' not found", name)
            }
            TransactionError::NamespaceAlreadyExists(name) => {
                write!(f, "Namespace '{}' already exists", name)
            }
            TransactionError::EntryNotFound(entry) => {
                write!(f, "Entry {} not found", entry)
            }
        }
    }
}

impl std::error::Error for TransactionError {}

/// 事务结果类型
pub type TransactionResult<T> = Result<T, TransactionError>;

/// 事务写入记录（提交时用于冲突检查）
#[derive(Debug, Clone)]
pub struct WriteRecord {
    /// 写入的命名空间
    pub namespace: String,
    /// 写入的条目
    pub entry: EntryId,
}

/// 事务
///
/// 一个正在进行的工作单元：持有获得的锁、累积的写入记录、
/// 延迟到提交时执行的动作与约束
pub struct Transaction {
    /// 事务ID
    pub id: TxId,
    /// 快照序列号（开始时分配，决定 MVCC 可见性）
    sequence_number: SeqNo,
    /// 事务状态
    pub status: TransactionStatus,
    /// 持有的锁
    held: Vec<(LockableKey, LockType)>,
    /// 写入记录
    writes: Vec<WriteRecord>,
    /// 提交后执行的延迟动作
    commit_actions: Vec<Box<dyn FnOnce() + Send>>,
    /// 提交前评估的约束（任一为 false 则提交失败并回滚）
    constraints: Vec<Box<dyn Fn() -> bool + Send>>,
    /// 开始时的提交标记（首个提交者获胜检查的基准）
    commit_marker: u64,
    /// 开始时间戳
    pub start_time: u64,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("sequence_number", &self.sequence_number)
            .field("status", &self.status)
            .field("held", &self.held)
            .field("writes", &self.writes)
            .finish()
    }
}

impl Transaction {
    /// 创建新事务
    fn new(id: TxId, sequence_number: SeqNo, commit_marker: u64) -> Self {
        Self {
            id,
            sequence_number,
            status: TransactionStatus::Active,
            held: Vec::new(),
            writes: Vec::new(),
            commit_actions: Vec::new(),
            constraints: Vec::new(),
            commit_marker,
            start_time: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_secs(),
        }
    }

    /// 快照序列号
    pub fn sequence_number(&self) -> SeqNo {
        self.sequence_number
    }

    /// 是否已完成
    pub fn is_completed(&self) -> bool {
        matches!(
            self.status,
            TransactionStatus::Committed | TransactionStatus::RolledBack
        )
    }

    /// 持有的锁（及授予的类型）
    pub fn held_lockables(&self) -> &[(LockableKey, LockType)] {
        &self.held
    }

    /// 写入记录
    pub fn writes(&self) -> &[WriteRecord] {
        &self.writes
    }

    /// 追加提交后动作
    pub fn add_commit_action<F>(&mut self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.commit_actions.push(Box::new(action));
    }

    /// 追加提交约束
    pub fn add_constraint<F>(&mut self, constraint: F)
    where
        F: Fn() -> bool + Send + 'static,
    {
        self.constraints.push(Box::new(constraint));
    }

    fn record_lock(&mut self, key: LockableKey, lock_type: LockType) {
        if let Some(entry) = self.held.iter_mut().find(|(k, _)| *k == key) {
            // 升级时只改类型，不重复记录
            if lock_type == LockType::Exclusive {
                entry.1 = LockType::Exclusive;
            }
        } else {
            self.held.push((key, lock_type));
        }
    }

    fn record_write(&mut self, namespace: &str, entry: EntryId) {
        self.writes.push(WriteRecord {
            namespace: namespace.to_string(),
            entry,
        });
    }

    fn constraints_hold(&self) -> bool {
        self.constraints.iter().all(|c| c())
    }

    fn run_commit_actions(&mut self) {
        for action in self.commit_actions.drain(..) {
            action();
        }
    }
}

/// 事务管理器
///
/// 协调锁管理器、死锁检测器、多版本存储与命名空间目录；
/// 所有方法都以 &self 提供，可在多个线程间共享
pub struct TransactionManager {
    /// 命名空间目录
    catalog: Arc<Catalog>,
    /// 锁管理器（内含安装的死锁检测器）
    locks: Arc<LockManager>,
    /// 多版本存储
    versions: Arc<VersionStore>,
    /// 活动事务及其快照序列号（低水位计算用）
    active: RwLock<HashMap<TxId, SeqNo>>,
    /// 下一个事务ID
    next_tx_id: AtomicU64,
    /// 下一个序列号
    next_seq: AtomicU64,
}

impl TransactionManager {
    /// 按配置创建事务管理器
    pub fn new(config: TransactionConfig) -> Self {
        let detector: Arc<dyn DeadlockDetector> = match config.detector {
            DetectorStrategy::Graph => Arc::new(GraphDetector::new()),
            DetectorStrategy::RequestSequence => Arc::new(RequestSequenceDetector::new()),
        };
        Self {
            catalog: Arc::new(Catalog::new(config.default_mode)),
            locks: Arc::new(LockManager::new(detector)),
            versions: Arc::new(VersionStore::new()),
            active: RwLock::new(HashMap::new()),
            next_tx_id: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
        }
    }

    /// 命名空间目录
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// 锁管理器
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// 多版本存储
    pub fn versions(&self) -> &Arc<VersionStore> {
        &self.versions
    }

    /// 开始新事务（ID 与序列号原子分配）
    pub fn begin_transaction(&self) -> Transaction {
        let id = self.next_tx_id.fetch_add(1, Ordering::SeqCst);
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.active.write().unwrap().insert(id, seq);
        Transaction::new(id, seq, self.versions.commit_marker())
    }

    fn ensure_active(&self, tx: &Transaction) -> TransactionResult<()> {
        if tx.is_completed() {
            return Err(TransactionError::TransactionAlreadyCompleted(tx.id, tx.status));
        }
        if !self.active.read().unwrap().contains_key(&tx.id) {
            return Err(TransactionError::TransactionNotFound(tx.id));
        }
        Ok(())
    }

    /// 显式获取可锁资源（查询层直接使用；可能阻塞，
    /// 可能以 DeadlockAbort 失败）
    pub fn acquire_lockable(
        &self,
        tx: &mut Transaction,
        key: LockableKey,
        lock_type: LockType,
    ) -> TransactionResult<()> {
        self.ensure_active(tx)?;
        self.locks.acquire(tx.id, &key, lock_type)?;
        tx.record_lock(key, lock_type);
        Ok(())
    }

    /// 插入条目，返回分配的条目ID
    pub fn insert_entry(
        &self,
        tx: &mut Transaction,
        namespace: &str,
        payload: Properties,
    ) -> TransactionResult<EntryId> {
        self.ensure_active(tx)?;
        identifier::check_properties(&payload)?;
        let mode = self.catalog.mode_of(namespace)?;

        let entry = self.versions.insert(tx.sequence_number(), payload);
        if mode == ConcurrencyMode::S2pl {
            // 新条目无人可见，排他锁立即可得
            let key = LockableKey::Entry(entry);
            self.locks.acquire(tx.id, &key, LockType::Exclusive)?;
            tx.record_lock(key, LockType::Exclusive);
        }
        tx.record_write(namespace, entry);
        Ok(entry)
    }

    /// 读取条目的可见载荷（附带保留的版本标识符字段）
    pub fn read_entry(
        &self,
        tx: &mut Transaction,
        namespace: &str,
        entry: EntryId,
    ) -> TransactionResult<Properties> {
        self.ensure_active(tx)?;
        let mode = self.catalog.mode_of(namespace)?;

        let snapshot = match mode {
            ConcurrencyMode::Mvcc => tx.sequence_number(),
            ConcurrencyMode::S2pl => {
                // S2PL 读取持共享锁到事务结束，读最新已提交版本
                let key = LockableKey::Entry(entry);
                self.locks.acquire(tx.id, &key, LockType::Shared)?;
                tx.record_lock(key, LockType::Shared);
                SeqNo::MAX
            }
        };

        let mut payload = self.versions.read(entry, snapshot, tx.sequence_number())?;
        payload.insert(RESERVED_VERSION_KEY.to_string(), Value::Int(entry as i64));
        Ok(payload)
    }

    /// 更新条目
    pub fn update_entry(
        &self,
        tx: &mut Transaction,
        namespace: &str,
        entry: EntryId,
        payload: Properties,
    ) -> TransactionResult<()> {
        self.ensure_active(tx)?;
        identifier::check_properties(&payload)?;
        let mode = self.catalog.mode_of(namespace)?;

        if mode == ConcurrencyMode::S2pl {
            let key = LockableKey::Entry(entry);
            self.locks.acquire(tx.id, &key, LockType::Exclusive)?;
            tx.record_lock(key, LockType::Exclusive);
        }
        self.versions.update(tx.sequence_number(), entry, payload)?;
        tx.record_write(namespace, entry);
        Ok(())
    }

    /// 删除条目
    pub fn delete_entry(
        &self,
        tx: &mut Transaction,
        namespace: &str,
        entry: EntryId,
    ) -> TransactionResult<()> {
        self.ensure_active(tx)?;
        let mode = self.catalog.mode_of(namespace)?;

        if mode == ConcurrencyMode::S2pl {
            let key = LockableKey::Entry(entry);
            self.locks.acquire(tx.id, &key, LockType::Exclusive)?;
            tx.record_lock(key, LockType::Exclusive);
        }
        self.versions.delete(tx.sequence_number(), entry)?;
        tx.record_write(namespace, entry);
        Ok(())
    }

    /// 提交事务
    ///
    /// 顺序：评估约束 -> MVCC 首个提交者获胜检查 ->
    /// 版本效果生效 -> 执行延迟动作 -> 释放全部锁。
    /// 约束不通过或写冲突时改为回滚并返回错误
    pub fn commit(&self, tx: &mut Transaction) -> TransactionResult<()> {
        self.ensure_active(tx)?;

        if !tx.constraints_hold() {
            self.versions.rollback(tx.sequence_number());
            self.finish(tx, TransactionStatus::RolledBack);
            return Err(TransactionError::ConstraintViolation);
        }

        let mvcc_entries: Vec<EntryId> = tx
            .writes()
            .iter()
            .filter(|w| {
                matches!(self.catalog.mode_of(&w.namespace), Ok(ConcurrencyMode::Mvcc))
            })
            .map(|w| w.entry)
            .collect();
        if let Err(err) = self
            .versions
            .validate_first_committer(tx.sequence_number(), tx.commit_marker, &mvcc_entries)
        {
            self.versions.rollback(tx.sequence_number());
            self.finish(tx, TransactionStatus::RolledBack);
            return Err(err);
        }

        self.versions.mark_committed(tx.sequence_number());
        tx.run_commit_actions();
        self.finish(tx, TransactionStatus::Committed);
        Ok(())
    }

    /// 回滚事务，丢弃全部版本效果
    pub fn rollback(&self, tx: &mut Transaction, reason: &str) -> TransactionResult<()> {
        self.ensure_active(tx)?;
        tracing::debug!(tx_id = tx.id, reason, "transaction rolled back");
        self.versions.rollback(tx.sequence_number());
        self.finish(tx, TransactionStatus::RolledBack);
        Ok(())
    }

    /// 收尾：释放锁、清理检测器等待边、移出活动集合
    fn finish(&self, tx: &mut Transaction, status: TransactionStatus) {
        self.locks.release_all(tx.id);
        self.active.write().unwrap().remove(&tx.id);
        tx.status = status;
        tx.held.clear();
    }

    /// 活动事务数
    pub fn active_count(&self) -> usize {
        self.active.read().unwrap().len()
    }

    /// 低水位：所有活动事务的最小快照序列号
    ///
    /// 没有活动事务时取最近分配的序列号，任何未来快照都
    /// 不小于它
    pub fn low_watermark(&self) -> SeqNo {
        self.active
            .read()
            .unwrap()
            .values()
            .min()
            .copied()
            .unwrap_or_else(|| self.next_seq.load(Ordering::SeqCst))
    }

    /// 触发一轮版本垃圾回收
    pub fn vacuum(&self) {
        self.versions.vacuum(self.low_watermark());
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(TransactionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mvcc_manager() -> TransactionManager {
        let tm = TransactionManager::new(
            TransactionConfig::new().with_default_mode(ConcurrencyMode::Mvcc),
        );
        tm.catalog().create_namespace("docs", &["name"], None).unwrap();
        tm
    }

    fn payload(v: i64) -> Properties {
        let mut props = Properties::new();
        props.insert("amount".to_string(), Value::Int(v));
        props
    }

    #[test]
    fn test_begin_assigns_monotonic_ids_and_sequences() {
        let tm = mvcc_manager();
        let tx1 = tm.begin_transaction();
        let tx2 = tm.begin_transaction();

        assert_eq!(tx1.id, 0);
        assert_eq!(tx2.id, 1);
        assert!(tx2.sequence_number() > tx1.sequence_number());
        assert_eq!(tm.active_count(), 2);
    }

    #[test]
    fn test_commit_finishes_transaction() {
        let tm = mvcc_manager();
        let mut tx = tm.begin_transaction();

        let entry = tm.insert_entry(&mut tx, "docs", payload(1)).unwrap();
        tm.commit(&mut tx).unwrap();

        assert_eq!(tx.status, TransactionStatus::Committed);
        assert_eq!(tm.active_count(), 0);
        assert!(tx.held_lockables().is_empty());

        // 提交后的写入对新事务可见
        let mut reader = tm.begin_transaction();
        let props = tm.read_entry(&mut reader, "docs", entry).unwrap();
        assert_eq!(props.get("amount"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_completed_transaction_is_rejected() {
        let tm = mvcc_manager();
        let mut tx = tm.begin_transaction();
        tm.commit(&mut tx).unwrap();

        assert!(matches!(
            tm.commit(&mut tx),
            Err(TransactionError::TransactionAlreadyCompleted(_, _))
        ));
        assert!(matches!(
            tm.insert_entry(&mut tx, "docs", payload(1)),
            Err(TransactionError::TransactionAlreadyCompleted(_, _))
        ));
    }

    #[test]
    fn test_rollback_discards_writes() {
        let tm = mvcc_manager();
        let mut tx = tm.begin_transaction();
        let entry = tm.insert_entry(&mut tx, "docs", payload(1)).unwrap();
        tm.rollback(&mut tx, "test").unwrap();
        assert_eq!(tx.status, TransactionStatus::RolledBack);

        let mut reader = tm.begin_transaction();
        assert!(tm.read_entry(&mut reader, "docs", entry).is_err());
    }

    #[test]
    fn test_failed_constraint_rolls_back_commit() {
        let tm = mvcc_manager();
        let mut tx = tm.begin_transaction();
        let entry = tm.insert_entry(&mut tx, "docs", payload(1)).unwrap();
        tx.add_constraint(|| false);

        assert!(matches!(
            tm.commit(&mut tx),
            Err(TransactionError::ConstraintViolation)
        ));
        assert_eq!(tx.status, TransactionStatus::RolledBack);

        // 约束失败的事务不留下任何版本效果
        let mut reader = tm.begin_transaction();
        assert!(tm.read_entry(&mut reader, "docs", entry).is_err());
    }

    #[test]
    fn test_commit_actions_run_on_successful_commit() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let tm = mvcc_manager();
        let fired = Arc::new(AtomicBool::new(false));
        let mut tx = tm.begin_transaction();
        let flag = Arc::clone(&fired);
        tx.add_commit_action(move || flag.store(true, Ordering::SeqCst));

        tm.commit(&mut tx).unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_read_exposes_reserved_version_field() {
        let tm = mvcc_manager();
        let mut tx = tm.begin_transaction();
        let entry = tm.insert_entry(&mut tx, "docs", payload(1)).unwrap();
        tm.commit(&mut tx).unwrap();

        let mut reader = tm.begin_transaction();
        let props = tm.read_entry(&mut reader, "docs", entry).unwrap();
        assert_eq!(
            props.get(RESERVED_VERSION_KEY),
            Some(&Value::Int(entry as i64))
        );
    }

    #[test]
    fn test_reserved_identifier_rejected_before_any_effect() {
        let tm = mvcc_manager();
        let mut tx = tm.begin_transaction();
        let mut props = payload(1);
        props.insert(RESERVED_VERSION_KEY.to_string(), Value::Int(9));

        assert!(matches!(
            tm.insert_entry(&mut tx, "docs", props),
            Err(TransactionError::ReservedIdentifier { .. })
        ));
        // 校验先于任何版本变更，没有残留写入
        assert!(tx.writes().is_empty());
        assert_eq!(tm.versions().stats().entry_count, 0);
    }

    #[test]
    fn test_low_watermark_tracks_active_snapshots() {
        let tm = mvcc_manager();
        let tx1 = tm.begin_transaction();
        let mut tx2 = tm.begin_transaction();

        assert_eq!(tm.low_watermark(), tx1.sequence_number());
        tm.commit(&mut tx2).unwrap();
        assert_eq!(tm.low_watermark(), tx1.sequence_number());
    }
}
