pub mod algorithm;
pub mod blockchain;
pub mod config;
pub mod events;
pub mod jobs;
pub mod metrics;
pub mod pool;
pub mod shares;
pub mod stratum;
pub mod util;
pub mod vardiff;

pub use config::PoolConfig;
pub use pool::{Pool, PoolOptions, PoolRuntime};
