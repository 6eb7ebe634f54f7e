//! Headless browser processes and the pool that lends them to pipeline
//! workers.

pub mod driver;
pub mod pool;

pub use driver::{BrowserDriver, BrowserHandle, BrowserPage, ChromeProcessDriver};
pub use pool::{BrowserLease, BrowserPool, PoolStats};
