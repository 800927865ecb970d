// 锁管理模块
//
// 提供悲观并发控制的可锁资源抽象：
// - 共享锁/排他锁的获取、升级、释放
// - 阻塞式等待（条件变量协作唤醒，不做轮询）
// - 每次等待都向安装的死锁检测器登记等待边，
//   被选为受害者的事务以 DeadlockAbort 失败返回

use crate::transactions::deadlock::DeadlockDetector;
use crate::transactions::transaction::{TransactionError, TransactionResult};
use crate::transactions::version_store::EntryId;
use crate::transactions::TxId;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

/// 锁类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    /// 共享锁（可多持有者）
    Shared,
    /// 排他锁（唯一持有者）
    Exclusive,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::Shared => write!(f, "SHARED"),
            LockType::Exclusive => write!(f, "EXCLUSIVE"),
        }
    }
}

/// 可锁资源标识
///
/// 互斥的最小单位：单个条目、整个命名空间或全局对象
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockableKey {
    Entry(EntryId),
    Namespace(String),
    Global,
}

impl fmt::Display for LockableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockableKey::Entry(id) => write!(f, "entry:{}", id),
            LockableKey::Namespace(name) => write!(f, "namespace:{}", name),
            LockableKey::Global => write!(f, "global"),
        }
    }
}

/// 排队的锁请求
#[derive(Debug, Clone)]
struct WaitingRequest {
    tx_id: TxId,
    requested: LockType,
}

/// 单个可锁资源的状态
///
/// 不变式：持有者要么为空，要么是唯一的排他持有者，
/// 要么是任意数量的共享持有者，绝不混合
#[derive(Debug)]
struct LockState {
    /// 持有者及各自获得的锁类型
    owners: HashMap<TxId, LockType>,
    /// 阻塞请求的 FIFO 等待队列
    waiters: VecDeque<WaitingRequest>,
}

impl LockState {
    fn new() -> Self {
        Self {
            owners: HashMap::new(),
            waiters: VecDeque::new(),
        }
    }

    /// 结构不变式检查：混合持有视为致命内部错误
    fn assert_consistent(&self) {
        let exclusive = self
            .owners
            .values()
            .filter(|&&t| t == LockType::Exclusive)
            .count();
        assert!(
            exclusive == 0 || self.owners.len() == 1,
            "lockable has mixed owner modes"
        );
    }

    /// 判断此刻能否授予 tx 请求的锁
    fn can_grant(&self, tx: TxId, requested: LockType) -> bool {
        if let Some(&held) = self.owners.get(&tx) {
            if held == LockType::Exclusive {
                // 已持排他锁：任何再请求都是幂等的
                return true;
            }
            if requested == LockType::Shared {
                return true;
            }
            // 共享升级排他：仅当自己是唯一持有者
            return self.owners.len() == 1;
        }

        match requested {
            // 共享与共享兼容，无持有者时直接授予
            LockType::Shared => !self
                .owners
                .values()
                .any(|&t| t == LockType::Exclusive),
            // 排他要求资源空闲；排队的排他请求按 FIFO 顺序授予
            LockType::Exclusive => {
                self.owners.is_empty()
                    && self.waiters.front().map_or(true, |w| w.tx_id == tx)
            }
        }
    }

    /// 授予锁（调用前必须通过 can_grant）
    fn grant(&mut self, tx: TxId, requested: LockType) {
        if let Some(held) = self.owners.get_mut(&tx) {
            // 升级不改变持有者集合大小；排他持有者请求共享保持排他
            if *held == LockType::Shared && requested == LockType::Exclusive {
                *held = LockType::Exclusive;
            }
        } else {
            self.owners.insert(tx, requested);
        }
        self.assert_consistent();
    }

    /// 当前以不兼容方式持有资源、使 tx 必须等待的事务
    fn blocking_owners(&self, tx: TxId, requested: LockType) -> Vec<TxId> {
        self.owners
            .iter()
            .filter(|&(&owner, &held)| {
                owner != tx
                    && (requested == LockType::Exclusive || held == LockType::Exclusive)
            })
            .map(|(&owner, _)| owner)
            .collect()
    }

    fn is_idle(&self) -> bool {
        self.owners.is_empty() && self.waiters.is_empty()
    }
}

/// 锁管理器
///
/// 管理所有可锁资源的获取、升级与释放。资源在首次请求时
/// 惰性创建，无持有者且无等待者时回收。所有变更都在同一
/// 临界区内完成，并与死锁检测器的图原子地保持同步
pub struct LockManager {
    /// 资源表
    table: Mutex<HashMap<LockableKey, LockState>>,
    /// 协作唤醒：释放或选出受害者时通知所有等待者重新评估
    wakeup: Condvar,
    /// 安装的死锁检测策略
    detector: Arc<dyn DeadlockDetector>,
}

impl LockManager {
    /// 创建新的锁管理器
    pub fn new(detector: Arc<dyn DeadlockDetector>) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            wakeup: Condvar::new(),
            detector,
        }
    }

    /// 安装的检测器
    pub fn detector(&self) -> &Arc<dyn DeadlockDetector> {
        &self.detector
    }

    /// 获取锁（可能阻塞调用线程）
    ///
    /// 兼容时立即授予；否则挂起等待，直到某次释放使请求
    /// 变得兼容，或死锁检测器将本事务选为受害者并以
    /// DeadlockAbort 唤醒
    pub fn acquire(
        &self,
        tx_id: TxId,
        key: &LockableKey,
        requested: LockType,
    ) -> TransactionResult<()> {
        let mut table = self.table.lock().unwrap();
        let mut enqueued = false;

        loop {
            let state = table.entry(key.clone()).or_insert_with(LockState::new);

            if state.can_grant(tx_id, requested) {
                if enqueued {
                    state.waiters.retain(|w| w.tx_id != tx_id);
                    // 只收回自己的出边；等待本事务的边依然有效
                    self.detector.add(key, tx_id, &[]);
                }
                state.grant(tx_id, requested);
                return Ok(());
            }

            // 必须等待：进入 FIFO 队列并刷新等待边
            // （add 按替换语义覆盖本事务之前登记的出边）
            if !enqueued {
                state.waiters.push_back(WaitingRequest {
                    tx_id,
                    requested,
                });
                enqueued = true;
            }
            let blockers = state.blocking_owners(tx_id, requested);
            self.detector.add(key, tx_id, &blockers);

            // 等待边登记后立即检查：若本次请求使环闭合，
            // 受害者在挂起前就能得到裁决
            let conflicts = self.detector.conflicting_transactions();
            if !conflicts.is_empty() {
                if select_victim(&conflicts) == Some(tx_id) {
                    let state = table.get_mut(key).unwrap();
                    state.waiters.retain(|w| w.tx_id != tx_id);
                    if state.is_idle() {
                        table.remove(key);
                    }
                    // 受害者仍持有别处的锁，指向它的入边保持有效，
                    // 全量清除留给回滚时的 release_all
                    self.detector.add(key, tx_id, &[]);
                    drop(table);
                    tracing::warn!(tx_id, lockable = %key, "deadlock victim aborted");
                    self.wakeup.notify_all();
                    return Err(TransactionError::DeadlockAbort { tx_id });
                }
                // 受害者是别的事务：唤醒所有等待者让它自行退出
                self.wakeup.notify_all();
            }

            table = self.wakeup.wait(table).unwrap();
        }
    }

    /// 升级为排他锁（已持共享锁时的便捷入口）
    pub fn upgrade_to_exclusive(
        &self,
        tx_id: TxId,
        key: &LockableKey,
    ) -> TransactionResult<()> {
        self.acquire(tx_id, key, LockType::Exclusive)
    }

    /// 释放单个资源上的锁
    pub fn release(&self, tx_id: TxId, key: &LockableKey) {
        let mut table = self.table.lock().unwrap();
        if let Some(state) = table.get_mut(key) {
            if state.owners.remove(&tx_id).is_some() {
                self.detector.remove(key, tx_id);
            }
            if state.is_idle() {
                table.remove(key);
            }
        }
        drop(table);
        self.wakeup.notify_all();
    }

    /// 释放事务持有和等待中的全部锁（提交/回滚/中止时调用）
    pub fn release_all(&self, tx_id: TxId) {
        let mut table = self.table.lock().unwrap();
        let keys: Vec<LockableKey> = table
            .iter()
            .filter(|(_, state)| {
                state.owners.contains_key(&tx_id)
                    || state.waiters.iter().any(|w| w.tx_id == tx_id)
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in keys {
            let state = table.get_mut(&key).unwrap();
            state.owners.remove(&tx_id);
            state.waiters.retain(|w| w.tx_id != tx_id);
            if state.is_idle() {
                table.remove(&key);
            }
            self.detector.remove(&key, tx_id);
        }
        drop(table);
        self.wakeup.notify_all();
    }

    /// 查询事务在某个资源上持有的锁类型
    pub fn holds(&self, tx_id: TxId, key: &LockableKey) -> Option<LockType> {
        let table = self.table.lock().unwrap();
        table.get(key).and_then(|state| state.owners.get(&tx_id).copied())
    }

    /// 资源当前是否被任何事务持有
    pub fn is_locked(&self, key: &LockableKey) -> bool {
        let table = self.table.lock().unwrap();
        table.get(key).map_or(false, |state| !state.owners.is_empty())
    }

    /// 事务持有的锁数量
    pub fn lock_count(&self, tx_id: TxId) -> usize {
        let table = self.table.lock().unwrap();
        table
            .values()
            .filter(|state| state.owners.contains_key(&tx_id))
            .count()
    }

    /// 获取统计信息
    pub fn stats(&self) -> LockManagerStats {
        let table = self.table.lock().unwrap();
        LockManagerStats {
            lockable_count: table.len(),
            owned_count: table.values().filter(|s| !s.owners.is_empty()).count(),
            waiting_count: table.values().map(|s| s.waiters.len()).sum(),
        }
    }
}

/// 从冲突集合中选出受害者
///
/// 全局图检测器的冲突集合本身就是闭环事务；请求序列检测器
/// 返回整个环，这里牺牲最年轻（序列号最大）的参与者
fn select_victim(conflicts: &std::collections::HashSet<TxId>) -> Option<TxId> {
    conflicts.iter().max().copied()
}

/// 锁管理器统计信息
#[derive(Debug, Clone, PartialEq)]
pub struct LockManagerStats {
    /// 当前存在的资源数
    pub lockable_count: usize,
    /// 有持有者的资源数
    pub owned_count: usize,
    /// 排队中的请求数
    pub waiting_count: usize,
}
