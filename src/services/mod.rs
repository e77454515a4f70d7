//! In-process collaborators around the graph engine: rate limiting, token
//! quota, stream slots and title generation.

pub mod naming;
pub mod quota;
pub mod rate_limit;
pub mod slots;

pub use naming::{HeuristicTitles, ModelTitles, NamingService, TitleGenerator};
pub use quota::{InMemoryQuota, QuotaService, UnlimitedQuota};
pub use rate_limit::{FixedWindowRateLimiter, RateLimiter, Unlimited};
pub use slots::{StreamSlot, StreamSlots};
