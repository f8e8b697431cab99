pub mod cancellation;
pub mod config;
pub mod fanout;
pub mod progress_bus;

pub use cancellation::CancellationRegistry;
pub use config::EngineConfig;
pub use fanout::FanOut;
pub use progress_bus::ProgressBus;
