// 并发控制测试
// 测试锁管理器的阻塞语义、死锁检测中止和 S2PL 下的更新序列化

use rs_multidb::catalog::ConcurrencyMode;
use rs_multidb::transactions::{
    DetectorStrategy, LockType, LockableKey, TransactionConfig, TransactionError,
    TransactionManager,
};
use rs_multidb::values::{Properties, Value};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// 辅助函数：创建带 S2PL 账户命名空间的管理器
fn s2pl_manager(detector: DetectorStrategy) -> Arc<TransactionManager> {
    let tm = TransactionManager::new(
        TransactionConfig::new()
            .with_default_mode(ConcurrencyMode::S2pl)
            .with_detector(detector),
    );
    tm.catalog()
        .create_namespace("accounts", &["amount"], None)
        .unwrap();
    Arc::new(tm)
}

fn amount(v: i64) -> Properties {
    let mut props = Properties::new();
    props.insert("amount".to_string(), Value::Int(v));
    props
}

fn read_amount(props: &Properties) -> i64 {
    match props.get("amount") {
        Some(Value::Int(v)) => *v,
        other => panic!("unexpected amount: {:?}", other),
    }
}

#[test]
fn test_exclusive_blocks_other_requests_until_release() {
    let tm = s2pl_manager(DetectorStrategy::Graph);
    let key = LockableKey::Entry(100);

    let mut holder = tm.begin_transaction();
    tm.acquire_lockable(&mut holder, key.clone(), LockType::Exclusive)
        .unwrap();

    let (tx_done, rx_done) = mpsc::channel();
    let tm2 = Arc::clone(&tm);
    let key2 = key.clone();
    let waiter = thread::spawn(move || {
        let mut tx = tm2.begin_transaction();
        tm2.acquire_lockable(&mut tx, key2, LockType::Shared).unwrap();
        tx_done.send(()).unwrap();
        tm2.commit(&mut tx).unwrap();
    });

    // 排他锁未释放时共享请求必须阻塞
    assert!(rx_done.recv_timeout(Duration::from_millis(200)).is_err());

    tm.commit(&mut holder).unwrap();
    assert!(rx_done.recv_timeout(Duration::from_secs(2)).is_ok());
    waiter.join().unwrap();
}

#[test]
fn test_shared_holders_do_not_block_third_shared() {
    let tm = s2pl_manager(DetectorStrategy::Graph);
    let key = LockableKey::Entry(200);

    let mut tx1 = tm.begin_transaction();
    let mut tx2 = tm.begin_transaction();
    let mut tx3 = tm.begin_transaction();
    tm.acquire_lockable(&mut tx1, key.clone(), LockType::Shared).unwrap();
    tm.acquire_lockable(&mut tx2, key.clone(), LockType::Shared).unwrap();
    // 第三个共享请求立即授予，不会阻塞
    tm.acquire_lockable(&mut tx3, key.clone(), LockType::Shared).unwrap();

    assert_eq!(tm.locks().holds(tx3.id, &key), Some(LockType::Shared));
}

#[test]
fn test_exclusive_holder_requesting_shared_stays_exclusive() {
    let tm = s2pl_manager(DetectorStrategy::Graph);
    let key = LockableKey::Namespace("accounts".to_string());

    let mut tx = tm.begin_transaction();
    tm.acquire_lockable(&mut tx, key.clone(), LockType::Exclusive).unwrap();
    let before = tm.locks().lock_count(tx.id);

    tm.acquire_lockable(&mut tx, key.clone(), LockType::Shared).unwrap();

    assert_eq!(tm.locks().holds(tx.id, &key), Some(LockType::Exclusive));
    assert_eq!(tm.locks().lock_count(tx.id), before);
}

// 构造一个跨两个资源的死锁，检查恰好一个事务被中止
fn run_deadlock_scenario(detector: DetectorStrategy) {
    let tm = s2pl_manager(detector);
    let key_a = LockableKey::Entry(1);
    let key_b = LockableKey::Entry(2);

    let mut tx1 = tm.begin_transaction();
    let mut tx2 = tm.begin_transaction();
    tm.acquire_lockable(&mut tx1, key_a.clone(), LockType::Exclusive).unwrap();
    tm.acquire_lockable(&mut tx2, key_b.clone(), LockType::Exclusive).unwrap();

    let (results_tx, results_rx) = mpsc::channel();

    let tm1 = Arc::clone(&tm);
    let sender1 = results_tx.clone();
    let kb = key_b.clone();
    let h1 = thread::spawn(move || {
        let result = tm1.acquire_lockable(&mut tx1, kb, LockType::Exclusive);
        let aborted = matches!(result, Err(TransactionError::DeadlockAbort { .. }));
        if aborted {
            tm1.rollback(&mut tx1, "deadlock victim").unwrap();
        } else {
            result.unwrap();
            tm1.commit(&mut tx1).unwrap();
        }
        sender1.send(aborted).unwrap();
    });

    let tm2 = Arc::clone(&tm);
    let sender2 = results_tx;
    let ka = key_a.clone();
    let h2 = thread::spawn(move || {
        let result = tm2.acquire_lockable(&mut tx2, ka, LockType::Exclusive);
        let aborted = matches!(result, Err(TransactionError::DeadlockAbort { .. }));
        if aborted {
            tm2.rollback(&mut tx2, "deadlock victim").unwrap();
        } else {
            result.unwrap();
            tm2.commit(&mut tx2).unwrap();
        }
        sender2.send(aborted).unwrap();
    });

    h1.join().unwrap();
    h2.join().unwrap();

    let first = results_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let second = results_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    // 恰好一个事务被选为受害者
    assert_eq!(
        [first, second].iter().filter(|aborted| **aborted).count(),
        1
    );
    // 中止后所有锁都已释放
    assert!(!tm.locks().is_locked(&key_a));
    assert!(!tm.locks().is_locked(&key_b));
}

#[test]
fn test_deadlock_aborts_exactly_one_transaction_graph() {
    run_deadlock_scenario(DetectorStrategy::Graph);
}

#[test]
fn test_deadlock_aborts_exactly_one_transaction_request_sequence() {
    run_deadlock_scenario(DetectorStrategy::RequestSequence);
}

#[test]
fn test_lost_update_prevented_under_s2pl() {
    let tm = s2pl_manager(DetectorStrategy::Graph);

    let mut setup = tm.begin_transaction();
    let entry = tm.insert_entry(&mut setup, "accounts", amount(100)).unwrap();
    tm.commit(&mut setup).unwrap();

    // 两个写入者各加10，读-改-写全程持锁；
    // 升级竞争导致的死锁受害者回滚后重试
    let mut handles = Vec::new();
    for _ in 0..2 {
        let tm = Arc::clone(&tm);
        handles.push(thread::spawn(move || loop {
            let mut tx = tm.begin_transaction();
            let attempt = (|| -> Result<(), TransactionError> {
                let props = tm.read_entry(&mut tx, "accounts", entry)?;
                let current = read_amount(&props);
                tm.update_entry(&mut tx, "accounts", entry, amount(current + 10))?;
                Ok(())
            })();
            match attempt {
                Ok(()) => {
                    tm.commit(&mut tx).unwrap();
                    break;
                }
                Err(TransactionError::DeadlockAbort { .. }) => {
                    tm.rollback(&mut tx, "retry after deadlock").unwrap();
                }
                Err(err) => panic!("unexpected error: {}", err),
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let mut check = tm.begin_transaction();
    let props = tm.read_entry(&mut check, "accounts", entry).unwrap();
    // 两次加法都不能丢失
    assert_eq!(read_amount(&props), 120);
}

#[test]
fn test_concurrent_increments_stress() {
    use rand::Rng;

    let tm = s2pl_manager(DetectorStrategy::RequestSequence);
    let mut setup = tm.begin_transaction();
    let entry = tm.insert_entry(&mut setup, "accounts", amount(0)).unwrap();
    tm.commit(&mut setup).unwrap();

    let threads = 4;
    let increments_per_thread = 25;
    let mut handles = Vec::new();
    for _ in 0..threads {
        let tm = Arc::clone(&tm);
        handles.push(thread::spawn(move || {
            let mut rng = rand::thread_rng();
            for _ in 0..increments_per_thread {
                loop {
                    let mut tx = tm.begin_transaction();
                    let attempt = (|| -> Result<(), TransactionError> {
                        let props = tm.read_entry(&mut tx, "accounts", entry)?;
                        let current = read_amount(&props);
                        if rng.gen_bool(0.2) {
                            thread::yield_now();
                        }
                        tm.update_entry(&mut tx, "accounts", entry, amount(current + 1))?;
                        Ok(())
                    })();
                    match attempt {
                        Ok(()) => {
                            tm.commit(&mut tx).unwrap();
                            break;
                        }
                        Err(TransactionError::DeadlockAbort { .. }) => {
                            tm.rollback(&mut tx, "retry").unwrap();
                        }
                        Err(err) => panic!("unexpected error: {}", err),
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let mut check = tm.begin_transaction();
    let props = tm.read_entry(&mut check, "accounts", entry).unwrap();
    assert_eq!(read_amount(&props), (threads * increments_per_thread) as i64);
    assert_eq!(tm.locks().stats().waiting_count, 0);
}
