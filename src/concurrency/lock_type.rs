// Lock modes for multigranularity locking.
//
// Six modes form the lattice from Gray's "Granularity of Locks": the real
// locks S and X, the intention modes IS and IX announcing locks further down
// the hierarchy, their combination SIX, and the absence of a lock NL. The
// three tables below are the whole protocol; everything above this module
// just consults them.

use std::fmt;

/// A lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    /// No lock.
    NoLock,
    /// Intention to take shared locks on descendants.
    IntentShared,
    /// Intention to take exclusive locks on descendants.
    IntentExclusive,
    /// Shared lock on this resource and its whole subtree.
    Shared,
    /// Shared lock plus intention to take exclusive locks on descendants.
    SharedIntentExclusive,
    /// Exclusive lock on this resource and its whole subtree.
    Exclusive,
}

impl LockType {
    /// True if locks of modes `a` and `b`, held by different transactions on
    /// the same resource, may coexist.
    pub fn compatible(a: LockType, b: LockType) -> bool {
        use LockType::*;
        match (a, b) {
            (NoLock, _) | (_, NoLock) => true,
            (IntentShared, Exclusive) | (Exclusive, IntentShared) => false,
            (IntentShared, _) | (_, IntentShared) => true,
            (IntentExclusive, IntentExclusive) => true,
            (Shared, Shared) => true,
            _ => false,
        }
    }

    /// True if a transaction holding `parent` on a resource may hold `child`
    /// on a descendant of that resource.
    pub fn can_be_parent(parent: LockType, child: LockType) -> bool {
        use LockType::*;
        match (parent, child) {
            (_, NoLock) => true,
            (IntentExclusive, _) => true,
            (IntentShared, IntentShared) | (IntentShared, Shared) => true,
            (SharedIntentExclusive, IntentExclusive) | (SharedIntentExclusive, Exclusive) => true,
            _ => false,
        }
    }

    /// True if holding `substitute` is sufficient wherever `required` is
    /// required.
    pub fn substitutable(substitute: LockType, required: LockType) -> bool {
        use LockType::*;
        match (substitute, required) {
            (_, NoLock) => true,
            (NoLock, _) => false,
            (Exclusive, _) => true,
            (SharedIntentExclusive, Exclusive) => false,
            (SharedIntentExclusive, _) => true,
            (Shared, IntentShared) | (Shared, Shared) => true,
            (IntentExclusive, IntentShared) | (IntentExclusive, IntentExclusive) => true,
            (IntentShared, IntentShared) => true,
            _ => false,
        }
    }

    /// The mode a parent must hold (at minimum) for this mode to be taken on
    /// a child.
    pub fn parent_lock(&self) -> LockType {
        use LockType::*;
        match self {
            NoLock => NoLock,
            IntentShared | Shared => IntentShared,
            IntentExclusive | SharedIntentExclusive | Exclusive => IntentExclusive,
        }
    }

    /// True for the intention modes IS, IX, and SIX.
    pub fn is_intent(&self) -> bool {
        use LockType::*;
        matches!(
            self,
            IntentShared | IntentExclusive | SharedIntentExclusive
        )
    }

    /// All six modes, for exhaustive table checks.
    pub fn all() -> [LockType; 6] {
        use LockType::*;
        [
            NoLock,
            IntentShared,
            IntentExclusive,
            Shared,
            SharedIntentExclusive,
            Exclusive,
        ]
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockType::NoLock => "NL",
            LockType::IntentShared => "IS",
            LockType::IntentExclusive => "IX",
            LockType::Shared => "S",
            LockType::SharedIntentExclusive => "SIX",
            LockType::Exclusive => "X",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::LockType::{self, *};

    // Row/column order: NL IS IX S SIX X.
    const ORDER: [LockType; 6] = [
        NoLock,
        IntentShared,
        IntentExclusive,
        Shared,
        SharedIntentExclusive,
        Exclusive,
    ];

    const COMPATIBLE: [[bool; 6]; 6] = [
        [true, true, true, true, true, true],
        [true, true, true, true, true, false],
        [true, true, true, false, false, false],
        [true, true, false, true, false, false],
        [true, true, false, false, false, false],
        [true, false, false, false, false, false],
    ];

    const PARENT: [[bool; 6]; 6] = [
        [true, false, false, false, false, false],
        [true, true, false, true, false, false],
        [true, true, true, true, true, true],
        [true, false, false, false, false, false],
        [true, false, true, false, false, true],
        [true, false, false, false, false, false],
    ];

    const SUBSTITUTABLE: [[bool; 6]; 6] = [
        [true, false, false, false, false, false],
        [true, true, false, false, false, false],
        [true, true, true, false, false, false],
        [true, true, false, true, false, false],
        [true, true, true, true, true, false],
        [true, true, true, true, true, true],
    ];

    #[test]
    fn test_compatibility_table() {
        for (i, &a) in ORDER.iter().enumerate() {
            for (j, &b) in ORDER.iter().enumerate() {
                assert_eq!(
                    LockType::compatible(a, b),
                    COMPATIBLE[i][j],
                    "compatible({a}, {b})"
                );
            }
        }
    }

    #[test]
    fn test_compatibility_symmetric() {
        for &a in &ORDER {
            for &b in &ORDER {
                assert_eq!(LockType::compatible(a, b), LockType::compatible(b, a));
            }
        }
    }

    #[test]
    fn test_parent_table() {
        for (i, &p) in ORDER.iter().enumerate() {
            for (j, &c) in ORDER.iter().enumerate() {
                assert_eq!(
                    LockType::can_be_parent(p, c),
                    PARENT[i][j],
                    "can_be_parent({p}, {c})"
                );
            }
        }
    }

    #[test]
    fn test_substitutability_table() {
        for (i, &s) in ORDER.iter().enumerate() {
            for (j, &r) in ORDER.iter().enumerate() {
                assert_eq!(
                    LockType::substitutable(s, r),
                    SUBSTITUTABLE[i][j],
                    "substitutable({s}, {r})"
                );
            }
        }
    }

    #[test]
    fn test_substitutability_reflexive_and_transitive() {
        for &a in &ORDER {
            assert!(LockType::substitutable(a, a));
        }
        for &a in &ORDER {
            for &b in &ORDER {
                for &c in &ORDER {
                    if LockType::substitutable(a, b) && LockType::substitutable(b, c) {
                        assert!(
                            LockType::substitutable(a, c),
                            "substitutable not transitive at ({a}, {b}, {c})"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_parent_lock_mapping() {
        assert_eq!(Shared.parent_lock(), IntentShared);
        assert_eq!(Exclusive.parent_lock(), IntentExclusive);
        assert_eq!(IntentShared.parent_lock(), IntentShared);
        assert_eq!(IntentExclusive.parent_lock(), IntentExclusive);
        assert_eq!(SharedIntentExclusive.parent_lock(), IntentExclusive);
        assert_eq!(NoLock.parent_lock(), NoLock);
    }

    #[test]
    fn test_parent_lock_is_sufficient_parent() {
        // The designated parent intention must actually admit the child.
        for &c in &ORDER {
            if c != NoLock {
                assert!(LockType::can_be_parent(c.parent_lock(), c));
            }
        }
    }
}
