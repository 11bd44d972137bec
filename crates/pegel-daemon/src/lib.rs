pub mod console;
pub mod core;
pub mod fetcher;
pub mod logging;
pub mod pool;
pub mod scheduler;
