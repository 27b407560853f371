// Concurrency control: hierarchical multigranularity locking.
//
// Layering, bottom up:
//
// | Module | Responsibility |
// |--------|----------------|
// | [`lock_type`] | lattice of lock modes and the three compatibility tables |
// | [`lock_manager`] | per-resource grant lists and FIFO wait queues |
// | [`lock_context`] | resource tree enforcing multigranularity constraints |
// | [`lock_util`] | declarative "make this effective lock true" helper |

pub mod error;
pub mod lock_context;
pub mod lock_manager;
pub mod lock_type;
pub mod lock_util;
pub mod resource;

pub use error::{LockError, LockResult};
pub use lock_context::LockContext;
pub use lock_manager::{Lock, LockManager, LockManagerConfig, LockManagerStats};
pub use lock_type::LockType;
pub use lock_util::ensure_sufficient_lock_held;
pub use resource::ResourceName;
