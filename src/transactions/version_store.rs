// 多版本存储模块（MVCC）
//
// 为每个逻辑条目维护一条只追加的版本链：
// - 每个版本记录创建者/删除者的事务序列号
// - 读事务按自身快照序列号计算可见版本
// - 提交时执行"首个提交者获胜"冲突检查
// - 低水位以下的不可见版本由垃圾回收清理

use crate::transactions::transaction::{TransactionError, TransactionResult};
use crate::transactions::SeqNo;
use crate::values::Properties;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// 条目ID（跨表/文档/图元素的稳定标识，
/// 以保留隐藏字段的形式暴露给应用层）
pub type EntryId = u64;

/// 单个版本
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    /// 创建该版本的事务序列号
    pub created_by: SeqNo,
    /// 删除该版本的事务序列号（当前版本为 None）
    pub deleted_by: Option<SeqNo>,
    /// 载荷
    pub payload: Properties,
}

impl Version {
    fn new(created_by: SeqNo, payload: Properties) -> Self {
        Self {
            created_by,
            deleted_by: None,
            payload,
        }
    }
}

/// 多版本存储
///
/// 版本链以条目ID索引存放在一个平面映射里（arena 结构，
/// 避免指针追逐）；序列号单调递增，完全决定可见性顺序
pub struct VersionStore {
    inner: Mutex<VersionStoreInner>,
}

struct VersionStoreInner {
    /// 条目ID -> 版本链（按追加顺序）
    chains: HashMap<EntryId, Vec<Version>>,
    /// 已提交事务的序列号 -> 提交顺序号
    committed: HashMap<SeqNo, u64>,
    /// 下一个提交顺序号（即至今发生的提交次数）
    next_commit_order: u64,
    /// 下一个条目ID
    next_entry_id: EntryId,
}

impl VersionStoreInner {
    /// 版本对快照 snapshot（读者序列号 reader）是否可见
    ///
    /// 可见当且仅当：由读者自己创建（未提交的自有写入），
    /// 或创建者已提交且 created_by <= snapshot；且未被
    /// 读者自己删除、也未被快照内已提交的事务删除
    fn is_visible(&self, version: &Version, snapshot: SeqNo, reader: SeqNo) -> bool {
        let created_visible = version.created_by == reader
            || (self.committed.contains_key(&version.created_by)
                && version.created_by <= snapshot);
        if !created_visible {
            return false;
        }

        match version.deleted_by {
            None => true,
            Some(deleter) => {
                deleter != reader
                    && !(self.committed.contains_key(&deleter) && deleter <= snapshot)
            }
        }
    }

    /// 链上对给定快照可见的版本
    fn visible_version<'a>(
        &self,
        chain: &'a [Version],
        snapshot: SeqNo,
        reader: SeqNo,
    ) -> Option<&'a Version> {
        // 链是追加式的，从尾部找到的第一个可见版本即当前版本
        chain
            .iter()
            .rev()
            .find(|v| self.is_visible(v, snapshot, reader))
    }

    /// 链上最后一个尚未打删除标记的版本
    fn current_mut(chain: &mut [Version]) -> Option<&mut Version> {
        chain.iter_mut().rev().find(|v| v.deleted_by.is_none())
    }
}

impl VersionStore {
    /// 创建新的多版本存储
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VersionStoreInner {
                chains: HashMap::new(),
                committed: HashMap::new(),
                next_commit_order: 0,
                next_entry_id: 0,
            }),
        }
    }

    /// 插入新条目，返回分配的条目ID
    pub fn insert(&self, tx_seq: SeqNo, payload: Properties) -> EntryId {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.next_entry_id;
        inner.next_entry_id += 1;
        inner.chains.insert(entry, vec![Version::new(tx_seq, payload)]);
        entry
    }

    /// 更新条目：旧的当前版本打上删除标记，追加新版本
    pub fn update(
        &self,
        tx_seq: SeqNo,
        entry: EntryId,
        payload: Properties,
    ) -> TransactionResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let chain = inner
            .chains
            .get_mut(&entry)
            .ok_or(TransactionError::EntryNotFound(entry))?;

        let current = VersionStoreInner::current_mut(chain)
            .ok_or(TransactionError::EntryNotFound(entry))?;
        current.deleted_by = Some(tx_seq);
        chain.push(Version::new(tx_seq, payload));
        Ok(())
    }

    /// 删除条目：当前版本打删除标记，不追加新版本
    pub fn delete(&self, tx_seq: SeqNo, entry: EntryId) -> TransactionResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let chain = inner
            .chains
            .get_mut(&entry)
            .ok_or(TransactionError::EntryNotFound(entry))?;

        let current = VersionStoreInner::current_mut(chain)
            .ok_or(TransactionError::EntryNotFound(entry))?;
        current.deleted_by = Some(tx_seq);
        Ok(())
    }

    /// 按快照读取条目的可见载荷
    pub fn read(
        &self,
        entry: EntryId,
        snapshot: SeqNo,
        reader: SeqNo,
    ) -> TransactionResult<Properties> {
        let inner = self.inner.lock().unwrap();
        let chain = inner
            .chains
            .get(&entry)
            .ok_or(TransactionError::EntryNotFound(entry))?;

        inner
            .visible_version(chain, snapshot, reader)
            .map(|v| v.payload.clone())
            .ok_or(TransactionError::EntryNotFound(entry))
    }

    /// 条目对给定快照可见的版本数（读一致性不变式：恒 <= 1）
    pub fn visible_version_count(&self, entry: EntryId, snapshot: SeqNo, reader: SeqNo) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .chains
            .get(&entry)
            .map(|chain| {
                chain
                    .iter()
                    .filter(|v| inner.is_visible(v, snapshot, reader))
                    .count()
            })
            .unwrap_or(0)
    }

    /// 当前提交标记（事务开始时记录）
    ///
    /// 等于至今发生的提交次数；提交顺序号不小于该标记的
    /// 事务都是在记录之后才提交的
    pub fn commit_marker(&self) -> u64 {
        self.inner.lock().unwrap().next_commit_order
    }

    /// 首个提交者获胜检查
    ///
    /// commit_marker 是本事务开始时记录的提交标记。提交事务
    /// 写过的条目上若存在别的事务在该标记之后提交的版本改动，
    /// 说明对方抢先提交，本次提交以 WriteConflict 失败。
    /// 以提交顺序判定，与双方的序列号先后无关
    pub fn validate_first_committer(
        &self,
        tx_seq: SeqNo,
        commit_marker: u64,
        entries: &[EntryId],
    ) -> TransactionResult<()> {
        let inner = self.inner.lock().unwrap();
        let committed_after = |seq: SeqNo| {
            seq != tx_seq
                && inner
                    .committed
                    .get(&seq)
                    .map_or(false, |&order| order >= commit_marker)
        };
        for &entry in entries {
            if let Some(chain) = inner.chains.get(&entry) {
                for version in chain {
                    if committed_after(version.created_by)
                        || version.deleted_by.map_or(false, |d| committed_after(d))
                    {
                        tracing::warn!(tx_seq, entry, "write conflict: first committer wins");
                        return Err(TransactionError::WriteConflict { entry });
                    }
                }
            }
        }
        Ok(())
    }

    /// 将事务的全部版本效果标记为已提交，分配提交顺序号
    pub fn mark_committed(&self, tx_seq: SeqNo) {
        let mut inner = self.inner.lock().unwrap();
        let order = inner.next_commit_order;
        inner.next_commit_order += 1;
        inner.committed.insert(tx_seq, order);
    }

    /// 丢弃事务未提交的版本效果
    ///
    /// 删除它追加的版本，撤销它打的删除标记。若被撤销标记的
    /// 版本在链上已有幸存的后继（并发更新者追加的版本），
    /// 删除标记改记为后继的创建者，保证链上最多一个当前版本
    pub fn rollback(&self, tx_seq: SeqNo) {
        let mut inner = self.inner.lock().unwrap();
        for chain in inner.chains.values_mut() {
            chain.retain(|v| v.created_by != tx_seq);
            for i in 0..chain.len() {
                if chain[i].deleted_by == Some(tx_seq) {
                    chain[i].deleted_by = chain.get(i + 1).map(|next| next.created_by);
                }
            }
        }
        inner.chains.retain(|_, chain| !chain.is_empty());
    }

    /// 垃圾回收
    ///
    /// low_watermark 是所有活动事务的最小快照序列号；
    /// 删除者已提交且不晚于低水位的版本对任何现有和未来的
    /// 快照都不可见，可以回收
    pub fn vacuum(&self, low_watermark: SeqNo) {
        let mut inner = self.inner.lock().unwrap();
        let committed = std::mem::take(&mut inner.committed);
        let mut reclaimed = 0usize;

        for chain in inner.chains.values_mut() {
            let before = chain.len();
            chain.retain(|v| match v.deleted_by {
                Some(deleter) => {
                    !(committed.contains_key(&deleter) && deleter <= low_watermark)
                }
                None => true,
            });
            reclaimed += before - chain.len();
        }
        inner.chains.retain(|_, chain| !chain.is_empty());
        inner.committed = committed;

        if reclaimed > 0 {
            tracing::debug!(reclaimed, low_watermark, "vacuumed stale versions");
        }
    }

    /// 获取统计信息
    pub fn stats(&self) -> VersionStoreStats {
        let inner = self.inner.lock().unwrap();
        VersionStoreStats {
            entry_count: inner.chains.len(),
            version_count: inner.chains.values().map(|c| c.len()).sum(),
            committed_transactions: inner.committed.len(),
        }
    }
}

impl Default for VersionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// 多版本存储统计信息
#[derive(Debug, Clone, PartialEq)]
pub struct VersionStoreStats {
    /// 存活的条目数
    pub entry_count: usize,
    /// 版本总数
    pub version_count: usize,
    /// 已提交事务数
    pub committed_transactions: usize,
}
