// 死锁检测模块
//
// 提供两种可互换的死锁检测策略：
// - GraphDetector：维护一张全局等待图，环闭合时只标记
//   最新加入并使环闭合的事务
// - RequestSequenceDetector：等待边按可锁资源分组存储，
//   环闭合时标记环中所有事务（由调用方挑选受害者）
//
// 两种策略对锁管理器暴露同一能力集：{add, remove, conflicting_transactions}

use crate::transactions::locks::LockableKey;
use crate::transactions::TxId;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// 死锁检测器能力集
///
/// 锁管理器只依赖该抽象，不关心安装的是哪种策略
pub trait DeadlockDetector: Send + Sync {
    /// 登记等待关系：tx 现在等待 successors 中的每个事务
    ///
    /// 以替换语义刷新 (key, tx) 的出边：一个事务同一时刻只
    /// 阻塞在一个资源上，旧出边随新一轮登记整体作废；
    /// successors 为空表示 tx 不再等待（请求刚被授予或中止）。
    /// 指向 tx 的入边不受影响，等待 tx 的事务自行维护
    fn add(&self, key: &LockableKey, tx: TxId, successors: &[TxId]);

    /// 清除归属于 (key, tx) 的全部等待边（含指向 tx 的入边），
    /// 事务释放资源或结束时调用
    fn remove(&self, key: &LockableKey, tx: TxId);

    /// 当前被标记为死锁冲突的事务集合
    ///
    /// 集合一直保留到相关等待边被移除为止
    fn conflicting_transactions(&self) -> HashSet<TxId>;

    /// 获取统计信息
    fn stats(&self) -> DetectorStats;
}

/// 检测器统计信息
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorStats {
    /// 图中有出边的事务数
    pub transaction_count: usize,
    /// 等待边数量
    pub edge_count: usize,
    /// 当前冲突事务数
    pub conflict_count: usize,
}

/// 判断 target 是否可以从 from 的后继出发到达（BFS）
fn reaches(adjacency: &HashMap<TxId, HashSet<TxId>>, from: TxId, target: TxId) -> bool {
    let mut visited = HashSet::new();
    let mut queue: VecDeque<TxId> = adjacency
        .get(&from)
        .map(|s| s.iter().copied().collect())
        .unwrap_or_default();

    while let Some(tx) = queue.pop_front() {
        if tx == target {
            return true;
        }
        if !visited.insert(tx) {
            continue;
        }
        if let Some(next) = adjacency.get(&tx) {
            queue.extend(next.iter().copied());
        }
    }

    false
}

/// 全局等待图死锁检测器
///
/// 所有资源共用一张图；插入使环闭合的事务被标记为冲突，
/// 环中的其它事务不受影响（乐观、低成本的解决策略）
pub struct GraphDetector {
    inner: Mutex<GraphInner>,
}

struct GraphInner {
    /// 邻接表：tx -> 它等待的事务集合
    adjacency: HashMap<TxId, HashSet<TxId>>,
    /// 使环闭合的事务（冲突集合）
    conflicts: HashSet<TxId>,
}

impl GraphDetector {
    /// 创建新的全局等待图检测器
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GraphInner {
                adjacency: HashMap::new(),
                conflicts: HashSet::new(),
            }),
        }
    }
}

impl Default for GraphDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl DeadlockDetector for GraphDetector {
    fn add(&self, _key: &LockableKey, tx: TxId, successors: &[TxId]) {
        let mut inner = self.inner.lock().unwrap();

        // 只替换 tx 自己的出边；别的等待者指向 tx 的边保持不动
        let outgoing: HashSet<TxId> = successors
            .iter()
            .copied()
            .filter(|&s| s != tx)
            .collect();
        if outgoing.is_empty() {
            inner.adjacency.remove(&tx);
        } else {
            inner.adjacency.insert(tx, outgoing);
        }

        // 替换可能解开旧环，先重验已有冲突；再从 tx 出发做
        // 可达性搜索：能回到自身说明本次登记使环闭合
        let adjacency = std::mem::take(&mut inner.adjacency);
        inner.conflicts.retain(|&c| reaches(&adjacency, c, c));
        if reaches(&adjacency, tx, tx) {
            tracing::warn!(tx_id = tx, "wait-for graph cycle closed");
            inner.conflicts.insert(tx);
        }
        inner.adjacency = adjacency;
    }

    fn remove(&self, _key: &LockableKey, tx: TxId) {
        let mut inner = self.inner.lock().unwrap();

        // 删除 tx 两个方向上的所有边
        inner.adjacency.remove(&tx);
        for successors in inner.adjacency.values_mut() {
            successors.remove(&tx);
        }
        inner.adjacency.retain(|_, s| !s.is_empty());

        // 重新验证冲突集合：不再能回到自身的事务退出冲突状态
        let adjacency = std::mem::take(&mut inner.adjacency);
        inner.conflicts.retain(|&c| reaches(&adjacency, c, c));
        inner.adjacency = adjacency;
    }

    fn conflicting_transactions(&self) -> HashSet<TxId> {
        self.inner.lock().unwrap().conflicts.clone()
    }

    fn stats(&self) -> DetectorStats {
        let inner = self.inner.lock().unwrap();
        DetectorStats {
            transaction_count: inner.adjacency.len(),
            edge_count: inner.adjacency.values().map(|s| s.len()).sum(),
            conflict_count: inner.conflicts.len(),
        }
    }
}

/// 按资源请求序列的死锁检测器
///
/// 等待边额外记录引起等待的资源：一对事务可能同时在两个
/// 不同资源上互相等待。环在所有资源边的并集上检测，
/// 冲突集合包含环中的每一个事务
pub struct RequestSequenceDetector {
    inner: Mutex<RequestSequenceInner>,
}

struct RequestSequenceInner {
    /// 每个资源一张等待图
    edges: HashMap<LockableKey, HashMap<TxId, HashSet<TxId>>>,
    /// 环中所有事务
    conflicts: HashSet<TxId>,
}

impl RequestSequenceDetector {
    /// 创建新的请求序列检测器
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RequestSequenceInner {
                edges: HashMap::new(),
                conflicts: HashSet::new(),
            }),
        }
    }
}

impl Default for RequestSequenceDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestSequenceInner {
    /// 合并所有资源的边，得到整体等待图
    fn union_graph(&self) -> HashMap<TxId, HashSet<TxId>> {
        let mut union: HashMap<TxId, HashSet<TxId>> = HashMap::new();
        for graph in self.edges.values() {
            for (&tx, successors) in graph {
                union.entry(tx).or_default().extend(successors.iter().copied());
            }
        }
        union
    }

    /// 重新计算冲突集合：并集图中位于任意环上的全部事务
    fn recompute_conflicts(&mut self) {
        let union = self.union_graph();
        let before = self.conflicts.len();
        self.conflicts = union
            .keys()
            .copied()
            .filter(|&tx| reaches(&union, tx, tx))
            .collect();
        if self.conflicts.len() > before {
            tracing::warn!(
                participants = self.conflicts.len(),
                "per-resource wait-for cycle detected"
            );
        }
    }
}

impl DeadlockDetector for RequestSequenceDetector {
    fn add(&self, key: &LockableKey, tx: TxId, successors: &[TxId]) {
        let mut inner = self.inner.lock().unwrap();

        // 替换 (key, tx) 的出边；同一资源上其它事务的边不动
        let outgoing: HashSet<TxId> = successors
            .iter()
            .copied()
            .filter(|&s| s != tx)
            .collect();
        let graph_empty = {
            let graph = inner.edges.entry(key.clone()).or_default();
            if outgoing.is_empty() {
                graph.remove(&tx);
            } else {
                graph.insert(tx, outgoing);
            }
            graph.is_empty()
        };
        if graph_empty {
            inner.edges.remove(key);
        }

        inner.recompute_conflicts();
    }

    fn remove(&self, key: &LockableKey, tx: TxId) {
        let mut inner = self.inner.lock().unwrap();

        // 只移除归属于 (key, tx) 的边；其它资源上的等待关系保留，
        // 环要等到所有相关资源的边都消失才算解除
        if let Some(graph) = inner.edges.get_mut(key) {
            graph.remove(&tx);
            for successors in graph.values_mut() {
                successors.remove(&tx);
            }
            graph.retain(|_, s| !s.is_empty());
            if graph.is_empty() {
                inner.edges.remove(key);
            }
        }

        inner.recompute_conflicts();
    }

    fn conflicting_transactions(&self) -> HashSet<TxId> {
        self.inner.lock().unwrap().conflicts.clone()
    }

    fn stats(&self) -> DetectorStats {
        let inner = self.inner.lock().unwrap();
        let union = inner.union_graph();
        DetectorStats {
            transaction_count: union.len(),
            edge_count: union.values().map(|s| s.len()).sum(),
            conflict_count: inner.conflicts.len(),
        }
    }
}
