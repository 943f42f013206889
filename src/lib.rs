pub mod backend;
pub mod commands;
pub mod memcache;
pub mod message;
pub mod metrics;
pub mod net;
pub mod pool;
pub mod proxy;
pub mod resp;
pub mod ring;
pub mod session;
pub mod string;

pub use bytes;
pub use net::Address;
