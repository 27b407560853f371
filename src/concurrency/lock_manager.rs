// Lock manager.
//
// Tracks, per resource, the list of granted locks and a FIFO queue of
// pending requests, plus a transaction -> resources index for per-transaction
// queries. Knows nothing about the resource hierarchy; multigranularity
// constraints live in [`super::lock_context`].
//
// The whole table sits behind one mutex with a single condvar. Grants happen
// only by dequeuing the longest mutually-compatible prefix of a resource's
// queue, so ordinary requests are served strictly first-come-first-served and
// cannot starve. Promotions and atomic acquire-and-release park at the front
// of the queue instead: they cannot jump over conflicting *granted* locks,
// but they are not starved by later arrivals. Blocked threads wait on the
// condvar and re-check whether their lock has appeared in the grant list.
//
// There is no deadlock detection; callers are expected to order their
// acquisitions (top-down via the lock contexts).

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::error::{LockError, LockResult};
use super::lock_type::LockType;
use super::resource::ResourceName;
use crate::common::TransactionId;

/// A granted lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub trans_num: TransactionId,
    pub name: ResourceName,
    pub lock_type: LockType,
}

/// Lock manager configuration.
#[derive(Debug, Clone, Default)]
pub struct LockManagerConfig {
    /// Upper bound on how long a blocked request waits. `None` waits
    /// indefinitely.
    pub wait_timeout: Option<Duration>,
}

/// Counters for lock manager activity.
///
/// `mutations` is the number of state-changing calls that succeeded; tests
/// use it to pin properties like escalation idempotence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockManagerStats {
    pub acquires: u64,
    pub releases: u64,
    pub promotes: u64,
    pub atomic_swaps: u64,
}

impl LockManagerStats {
    pub fn mutations(&self) -> u64 {
        self.acquires + self.releases + self.promotes + self.atomic_swaps
    }
}

#[derive(Default)]
struct StatCounters {
    acquires: AtomicU64,
    releases: AtomicU64,
    promotes: AtomicU64,
    atomic_swaps: AtomicU64,
}

/// A pending request. `release` lists this transaction's locks to drop in
/// the same atomic step the grant happens (empty for plain acquires).
struct Request {
    trans_num: TransactionId,
    lock_type: LockType,
    release: Vec<ResourceName>,
}

#[derive(Default)]
struct ResourceEntry {
    granted: Vec<Lock>,
    queue: VecDeque<Request>,
}

impl ResourceEntry {
    /// True if `mode` for `trans_num` is compatible with every lock granted
    /// to other transactions. The requester's own locks never block it; they
    /// are either being replaced or were rejected as duplicates earlier.
    fn grantable(&self, trans_num: TransactionId, mode: LockType) -> bool {
        self.granted
            .iter()
            .all(|l| l.trans_num == trans_num || LockType::compatible(l.lock_type, mode))
    }
}

#[derive(Default)]
struct LockTable {
    resources: HashMap<ResourceName, ResourceEntry>,
    by_txn: HashMap<TransactionId, Vec<ResourceName>>,
}

impl LockTable {
    fn held_type(&self, trans_num: TransactionId, name: &ResourceName) -> Option<LockType> {
        self.resources.get(name).and_then(|e| {
            e.granted
                .iter()
                .find(|l| l.trans_num == trans_num)
                .map(|l| l.lock_type)
        })
    }

    fn grant(&mut self, lock: Lock) {
        self.by_txn
            .entry(lock.trans_num)
            .or_default()
            .push(lock.name.clone());
        self.resources
            .entry(lock.name.clone())
            .or_default()
            .granted
            .push(lock);
    }

    fn remove(&mut self, trans_num: TransactionId, name: &ResourceName) {
        if let Some(entry) = self.resources.get_mut(name) {
            entry.granted.retain(|l| l.trans_num != trans_num);
        }
        if let Some(names) = self.by_txn.get_mut(&trans_num) {
            if let Some(pos) = names.iter().position(|n| n == name) {
                names.swap_remove(pos);
            }
            if names.is_empty() {
                self.by_txn.remove(&trans_num);
            }
        }
    }

    /// Grants the longest grantable prefix of each queue in the worklist,
    /// feeding resources whose locks were dropped back into the worklist.
    fn process_queues(&mut self, start: ResourceName) {
        let mut worklist = vec![start];
        while let Some(name) = worklist.pop() {
            loop {
                let entry = match self.resources.get_mut(&name) {
                    Some(e) => e,
                    None => break,
                };
                let front = entry.queue.front().map(|r| (r.trans_num, r.lock_type));
                let front_ok = match front {
                    Some((trans_num, lock_type)) => entry.grantable(trans_num, lock_type),
                    None => false,
                };
                if !front_ok {
                    break;
                }
                let request = entry.queue.pop_front().expect("front request vanished");
                for released in &request.release {
                    self.remove(request.trans_num, released);
                    if *released != name {
                        worklist.push(released.clone());
                    }
                }
                self.grant(Lock {
                    trans_num: request.trans_num,
                    name: name.clone(),
                    lock_type: request.lock_type,
                });
            }
        }
    }
}

/// Lock manager over a flat namespace of resources.
pub struct LockManager {
    table: Mutex<LockTable>,
    waiters: Condvar,
    config: LockManagerConfig,
    stats: StatCounters,
}

impl LockManager {
    pub fn new(config: LockManagerConfig) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            waiters: Condvar::new(),
            config,
            stats: StatCounters::default(),
        }
    }

    /// Acquires `lock_type` on `name` for the transaction, blocking while the
    /// request is incompatible with granted locks or queued behind others.
    pub fn acquire(
        &self,
        trans_num: TransactionId,
        name: ResourceName,
        lock_type: LockType,
    ) -> LockResult<()> {
        if lock_type == LockType::NoLock {
            return Err(LockError::invalid("NL is never a valid lock request"));
        }
        let mut table = self.table.lock();
        if let Some(held) = table.held_type(trans_num, &name) {
            return Err(LockError::DuplicateLockRequest {
                trans_num,
                name,
                held,
            });
        }
        let entry = table.resources.entry(name.clone()).or_default();
        if entry.queue.is_empty() && entry.grantable(trans_num, lock_type) {
            table.grant(Lock {
                trans_num,
                name,
                lock_type,
            });
        } else {
            entry.queue.push_back(Request {
                trans_num,
                lock_type,
                release: Vec::new(),
            });
            self.wait_for_grant(&mut table, trans_num, &name, lock_type)?;
        }
        self.stats.acquires.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Releases the transaction's lock on `name` and grants whatever prefix
    /// of the wait queue has become compatible.
    pub fn release(&self, trans_num: TransactionId, name: &ResourceName) -> LockResult<()> {
        let mut table = self.table.lock();
        if table.held_type(trans_num, name).is_none() {
            return Err(LockError::NoLockHeld {
                trans_num,
                name: name.clone(),
            });
        }
        table.remove(trans_num, name);
        table.process_queues(name.clone());
        self.stats.releases.fetch_add(1, Ordering::Relaxed);
        self.waiters.notify_all();
        Ok(())
    }

    /// Atomically replaces the transaction's lock on `name` with a strictly
    /// stronger mode.
    pub fn promote(
        &self,
        trans_num: TransactionId,
        name: &ResourceName,
        new_type: LockType,
    ) -> LockResult<()> {
        if new_type == LockType::NoLock {
            return Err(LockError::invalid("cannot promote to NL"));
        }
        let mut table = self.table.lock();
        let held = table
            .held_type(trans_num, name)
            .ok_or_else(|| LockError::NoLockHeld {
                trans_num,
                name: name.clone(),
            })?;
        if held == new_type {
            return Err(LockError::DuplicateLockRequest {
                trans_num,
                name: name.clone(),
                held,
            });
        }
        if !LockType::substitutable(new_type, held) {
            return Err(LockError::invalid(format!(
                "promotion from {held} to {new_type} is not a strengthening"
            )));
        }
        let entry = table.resources.entry(name.clone()).or_default();
        if entry.grantable(trans_num, new_type) {
            let lock = entry
                .granted
                .iter_mut()
                .find(|l| l.trans_num == trans_num)
                .expect("held lock vanished under the table mutex");
            lock.lock_type = new_type;
            table.process_queues(name.clone());
        } else {
            entry.queue.push_front(Request {
                trans_num,
                lock_type: new_type,
                release: vec![name.clone()],
            });
            self.wait_for_grant(&mut table, trans_num, name, new_type)?;
        }
        self.stats.promotes.fetch_add(1, Ordering::Relaxed);
        self.waiters.notify_all();
        Ok(())
    }

    /// Grants `lock_type` on `name` and releases every lock in `release` as
    /// one atomic event. `name` may itself appear in `release`, which is how
    /// SIX promotion and escalation swap a lock in place.
    pub fn acquire_and_release(
        &self,
        trans_num: TransactionId,
        name: ResourceName,
        lock_type: LockType,
        release: &[ResourceName],
    ) -> LockResult<()> {
        if lock_type == LockType::NoLock {
            return Err(LockError::invalid("NL is never a valid lock request"));
        }
        let mut release: Vec<ResourceName> = release.to_vec();
        release.sort();
        release.dedup();
        let mut table = self.table.lock();
        if let Some(held) = table.held_type(trans_num, &name) {
            if !release.contains(&name) {
                return Err(LockError::DuplicateLockRequest {
                    trans_num,
                    name,
                    held,
                });
            }
        }
        for released in &release {
            if table.held_type(trans_num, released).is_none() {
                return Err(LockError::NoLockHeld {
                    trans_num,
                    name: released.clone(),
                });
            }
        }
        let entry = table.resources.entry(name.clone()).or_default();
        if entry.grantable(trans_num, lock_type) {
            for released in &release {
                table.remove(trans_num, released);
            }
            table.grant(Lock {
                trans_num,
                name: name.clone(),
                lock_type,
            });
            for released in &release {
                table.process_queues(released.clone());
            }
        } else {
            entry.queue.push_front(Request {
                trans_num,
                lock_type,
                release,
            });
            self.wait_for_grant(&mut table, trans_num, &name, lock_type)?;
        }
        self.stats.atomic_swaps.fetch_add(1, Ordering::Relaxed);
        self.waiters.notify_all();
        Ok(())
    }

    /// Every lock held by the transaction.
    pub fn get_locks(&self, trans_num: TransactionId) -> Vec<Lock> {
        let table = self.table.lock();
        let names = match table.by_txn.get(&trans_num) {
            Some(names) => names.clone(),
            None => return Vec::new(),
        };
        names
            .iter()
            .filter_map(|name| {
                table.held_type(trans_num, name).map(|lock_type| Lock {
                    trans_num,
                    name: name.clone(),
                    lock_type,
                })
            })
            .collect()
    }

    /// Every lock granted on the resource.
    pub fn get_locks_on(&self, name: &ResourceName) -> Vec<Lock> {
        let table = self.table.lock();
        table
            .resources
            .get(name)
            .map(|e| e.granted.clone())
            .unwrap_or_default()
    }

    /// The transaction's locks on strict descendants of `name`.
    pub fn get_descendant_locks(
        &self,
        trans_num: TransactionId,
        name: &ResourceName,
    ) -> Vec<Lock> {
        self.get_locks(trans_num)
            .into_iter()
            .filter(|l| l.name.is_descendant_of(name))
            .collect()
    }

    /// The mode the transaction holds on `name`, or NL.
    pub fn lock_type_held(&self, trans_num: TransactionId, name: &ResourceName) -> LockType {
        self.table
            .lock()
            .held_type(trans_num, name)
            .unwrap_or(LockType::NoLock)
    }

    /// Activity counters.
    pub fn stats(&self) -> LockManagerStats {
        LockManagerStats {
            acquires: self.stats.acquires.load(Ordering::Relaxed),
            releases: self.stats.releases.load(Ordering::Relaxed),
            promotes: self.stats.promotes.load(Ordering::Relaxed),
            atomic_swaps: self.stats.atomic_swaps.load(Ordering::Relaxed),
        }
    }

    /// Blocks until the transaction's lock on `name` is exactly `expected`,
    /// or the configured wait bound expires (withdrawing the request).
    fn wait_for_grant(
        &self,
        table: &mut MutexGuard<'_, LockTable>,
        trans_num: TransactionId,
        name: &ResourceName,
        expected: LockType,
    ) -> LockResult<()> {
        let deadline = self.config.wait_timeout.map(|d| Instant::now() + d);
        loop {
            if table.held_type(trans_num, name) == Some(expected) {
                return Ok(());
            }
            match deadline {
                None => {
                    self.waiters.wait(table);
                }
                Some(deadline) => {
                    if self.waiters.wait_until(table, deadline).timed_out() {
                        if table.held_type(trans_num, name) == Some(expected) {
                            return Ok(());
                        }
                        if let Some(entry) = table.resources.get_mut(name) {
                            entry.queue.retain(|r| {
                                !(r.trans_num == trans_num && r.lock_type == expected)
                            });
                        }
                        return Err(LockError::WaitTimeout {
                            trans_num,
                            name: name.clone(),
                        });
                    }
                }
            }
        }
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.lock();
        f.debug_struct("LockManager")
            .field("resources", &table.resources.len())
            .field("transactions", &table.by_txn.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use LockType::*;

    fn name(path: &[&str]) -> ResourceName {
        let mut it = path.iter();
        let mut n = ResourceName::root(*it.next().unwrap());
        for seg in it {
            n = n.child(*seg);
        }
        n
    }

    #[test]
    fn test_acquire_and_duplicate() {
        let lm = LockManager::new(LockManagerConfig::default());
        let db = name(&["database"]);
        lm.acquire(1, db.clone(), Shared).unwrap();
        assert_eq!(lm.lock_type_held(1, &db), Shared);
        assert!(matches!(
            lm.acquire(1, db.clone(), Shared),
            Err(LockError::DuplicateLockRequest { .. })
        ));
        assert!(matches!(
            lm.acquire(1, db.clone(), Exclusive),
            Err(LockError::DuplicateLockRequest { .. })
        ));
    }

    #[test]
    fn test_nl_request_rejected() {
        let lm = LockManager::new(LockManagerConfig::default());
        assert!(matches!(
            lm.acquire(1, name(&["database"]), NoLock),
            Err(LockError::InvalidLock { .. })
        ));
    }

    #[test]
    fn test_compatible_grants_coexist() {
        let lm = LockManager::new(LockManagerConfig::default());
        let db = name(&["database"]);
        lm.acquire(1, db.clone(), IntentShared).unwrap();
        lm.acquire(2, db.clone(), IntentExclusive).unwrap();
        lm.acquire(3, db.clone(), IntentShared).unwrap();
        assert_eq!(lm.get_locks_on(&db).len(), 3);
    }

    #[test]
    fn test_release_requires_lock() {
        let lm = LockManager::new(LockManagerConfig::default());
        let db = name(&["database"]);
        assert!(matches!(
            lm.release(1, &db),
            Err(LockError::NoLockHeld { .. })
        ));
    }

    #[test]
    fn test_wait_timeout_withdraws_request() {
        let lm = LockManager::new(LockManagerConfig {
            wait_timeout: Some(Duration::from_millis(20)),
        });
        let db = name(&["database"]);
        lm.acquire(1, db.clone(), Exclusive).unwrap();
        assert!(matches!(
            lm.acquire(2, db.clone(), Shared),
            Err(LockError::WaitTimeout { .. })
        ));
        // The withdrawn request no longer blocks later grants.
        lm.release(1, &db).unwrap();
        lm.acquire(3, db.clone(), Shared).unwrap();
    }

    #[test]
    fn test_blocked_request_granted_on_release() {
        let lm = Arc::new(LockManager::new(LockManagerConfig::default()));
        let db = name(&["database"]);
        lm.acquire(1, db.clone(), Exclusive).unwrap();

        let granted = Arc::new(AtomicBool::new(false));
        crossbeam::scope(|s| {
            let lm2 = lm.clone();
            let db2 = db.clone();
            let granted2 = granted.clone();
            s.spawn(move |_| {
                lm2.acquire(2, db2, Shared).unwrap();
                granted2.store(true, Ordering::SeqCst);
            });
            std::thread::sleep(Duration::from_millis(50));
            assert!(!granted.load(Ordering::SeqCst));
            lm.release(1, &db).unwrap();
        })
        .unwrap();
        assert!(granted.load(Ordering::SeqCst));
        assert_eq!(lm.lock_type_held(2, &db), Shared);
    }

    #[test]
    fn test_fifo_prefix_granting() {
        let lm = Arc::new(LockManager::new(LockManagerConfig::default()));
        let db = name(&["database"]);
        lm.acquire(1, db.clone(), Exclusive).unwrap();

        crossbeam::scope(|s| {
            // Queue: X(2), then S(3), S(4). When 1 releases, only 2 gets in;
            // when 2 releases, 3 and 4 are granted together.
            let spawn_acquire = |t: TransactionId, mode: LockType| {
                let lm = lm.clone();
                let db = db.clone();
                s.spawn(move |_| lm.acquire(t, db, mode).unwrap());
            };
            spawn_acquire(2, Exclusive);
            std::thread::sleep(Duration::from_millis(30));
            spawn_acquire(3, Shared);
            spawn_acquire(4, Shared);
            std::thread::sleep(Duration::from_millis(30));

            lm.release(1, &db).unwrap();
            std::thread::sleep(Duration::from_millis(30));
            assert_eq!(lm.lock_type_held(2, &db), Exclusive);
            assert_eq!(lm.lock_type_held(3, &db), NoLock);
            assert_eq!(lm.lock_type_held(4, &db), NoLock);

            lm.release(2, &db).unwrap();
            std::thread::sleep(Duration::from_millis(30));
            assert_eq!(lm.lock_type_held(3, &db), Shared);
            assert_eq!(lm.lock_type_held(4, &db), Shared);
        })
        .unwrap();
    }

    #[test]
    fn test_promote_validation() {
        let lm = LockManager::new(LockManagerConfig::default());
        let db = name(&["database"]);
        assert!(matches!(
            lm.promote(1, &db, Exclusive),
            Err(LockError::NoLockHeld { .. })
        ));
        lm.acquire(1, db.clone(), Shared).unwrap();
        assert!(matches!(
            lm.promote(1, &db, Shared),
            Err(LockError::DuplicateLockRequest { .. })
        ));
        assert!(matches!(
            lm.promote(1, &db, IntentShared),
            Err(LockError::InvalidLock { .. })
        ));
        lm.promote(1, &db, Exclusive).unwrap();
        assert_eq!(lm.lock_type_held(1, &db), Exclusive);
    }

    #[test]
    fn test_acquire_and_release_swaps_atomically() {
        let lm = LockManager::new(LockManagerConfig::default());
        let db = name(&["database"]);
        let t1 = name(&["database", "t1"]);
        let p3 = name(&["database", "t1", "3"]);
        lm.acquire(1, db.clone(), IntentExclusive).unwrap();
        lm.acquire(1, t1.clone(), IntentExclusive).unwrap();
        lm.acquire(1, p3.clone(), Shared).unwrap();

        lm.acquire_and_release(1, t1.clone(), SharedIntentExclusive, &[t1.clone(), p3.clone()])
            .unwrap();
        assert_eq!(lm.lock_type_held(1, &t1), SharedIntentExclusive);
        assert_eq!(lm.lock_type_held(1, &p3), NoLock);
        assert_eq!(lm.get_locks(1).len(), 2);
    }

    #[test]
    fn test_acquire_and_release_requires_held_releases() {
        let lm = LockManager::new(LockManagerConfig::default());
        let db = name(&["database"]);
        let t1 = name(&["database", "t1"]);
        lm.acquire(1, db.clone(), IntentShared).unwrap();
        assert!(matches!(
            lm.acquire_and_release(1, db.clone(), Shared, &[db.clone(), t1.clone()]),
            Err(LockError::NoLockHeld { .. })
        ));
        // Holding the target without listing it for release is a duplicate.
        assert!(matches!(
            lm.acquire_and_release(1, db.clone(), Shared, &[]),
            Err(LockError::DuplicateLockRequest { .. })
        ));
    }

    #[test]
    fn test_release_unblocks_other_resource_waiters() {
        // An acquire-and-release dropping a lock on another resource must
        // wake that resource's queue.
        let lm = Arc::new(LockManager::new(LockManagerConfig::default()));
        let a = name(&["database", "a"]);
        let b = name(&["database", "b"]);
        lm.acquire(1, a.clone(), Shared).unwrap();
        lm.acquire(1, b.clone(), Exclusive).unwrap();

        let granted = Arc::new(AtomicBool::new(false));
        crossbeam::scope(|s| {
            let lm2 = lm.clone();
            let b2 = b.clone();
            let granted2 = granted.clone();
            s.spawn(move |_| {
                lm2.acquire(2, b2, Shared).unwrap();
                granted2.store(true, Ordering::SeqCst);
            });
            std::thread::sleep(Duration::from_millis(50));
            assert!(!granted.load(Ordering::SeqCst));
            // Swap S(a) -> X(a) while dropping X(b).
            lm.acquire_and_release(1, a.clone(), Exclusive, &[a.clone(), b.clone()])
                .unwrap();
        })
        .unwrap();
        assert!(granted.load(Ordering::SeqCst));
        assert_eq!(lm.lock_type_held(1, &a), Exclusive);
        assert_eq!(lm.lock_type_held(2, &b), Shared);
    }

    #[test]
    fn test_stats_count_mutations() {
        let lm = LockManager::new(LockManagerConfig::default());
        let db = name(&["database"]);
        lm.acquire(1, db.clone(), Shared).unwrap();
        lm.promote(1, &db, Exclusive).unwrap();
        lm.release(1, &db).unwrap();
        let stats = lm.stats();
        assert_eq!(stats.acquires, 1);
        assert_eq!(stats.promotes, 1);
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.mutations(), 3);
    }
}
