pub mod config;
pub mod error;
pub mod process;

pub use config::{AppConfig, BitcoinConfig, ConsoleConfig, CorsConfig, RateLimiterConfig, ServerConfig};
pub use error::{MempoolError, MempoolResult};
