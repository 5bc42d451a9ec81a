//! Session aware memoization of compiled plans and result sets.
//!
//! Keys are [`CacheId`]s normalized by the value's determinism level, so a
//! result that does not depend on the session (or the user) is shared
//! across sessions (or users).

mod cache_id;
mod results;
mod session_cache;

pub use cache_id::CacheId;
pub use results::CachedResults;
pub use session_cache::{Cachable, CacheStats, SessionAwareCache};
