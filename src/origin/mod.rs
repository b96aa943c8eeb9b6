//! Origin handlers behind the cache: a streaming reverse proxy to the
//! upstream lookup service and the session side effects of
//! non-short-circuit routes.

mod proxy;
mod session;

pub use proxy::{OriginState, SESSION_HEADER, origin_router};
pub use session::{SessionRecord, SessionStore};
