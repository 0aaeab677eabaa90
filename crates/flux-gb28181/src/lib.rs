// GB28181 指令核心
// 云台编码、对话关联、会话存储与指令调度

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod manscdp;
pub mod ptz;
pub mod session;
pub mod sip;
pub mod store;
pub mod transport;

pub use cache::{Cache, MemoryCache};
pub use config::GbConfig;
pub use dispatcher::CommandDispatcher;
pub use error::{CorrelationError, GbError, Result};
pub use ptz::{PtzCommand, PtzDirection, PtzFrame, PtzZoom};
pub use session::{DialogRecord, StreamSession};
pub use store::SessionStore;
pub use transport::{SipTransport, TransactionHandle, UdpTransport};

#[cfg(feature = "redis-cache")]
pub use cache::RedisCache;
