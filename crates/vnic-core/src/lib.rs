//! vnic-core: building blocks shared by every vnic layer.
//!
//! Provides a statically typed LRU cache, the MTU-sized packet pool that
//! feeds the virtual stack, the relay buffer pool used by port forwarding,
//! and the TOML configuration model.

pub mod config;
pub mod error;
pub mod lru;
pub mod packet;
pub mod pool;

pub use config::{Config, DnsConfig, ForwardRule, InterfaceConfig, Target};
pub use error::{CoreError, CoreResult};
pub use lru::LruCache;
pub use packet::{Packet, PacketPool, DEFAULT_MTU, IP_PACKET_OFFSET};
pub use pool::{BufferPool, PooledBuffer, RELAY_BUFFER_SIZE};
