mod lock_context;
mod lock_manager;
mod lock_type;
mod lock_util;
mod resource;

pub use lock_context::LockContext;
pub use lock_manager::{Lock, LockManager};
pub use lock_type::LockType;
pub use lock_util::ensure_sufficient;
pub use resource::ResourceName;
