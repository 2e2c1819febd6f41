pub mod config;
pub mod confusables;
pub mod controller;
pub mod deobfuscate;
pub mod error;
pub mod interceptor;
pub mod monitor;
pub mod normalizer;
pub mod rules;
pub mod scoring;
pub mod state;
pub mod status;

pub use config::{ConfigLoader, FileConfigLoader, KeyValueConfig, Settings};
pub use controller::{CoreController, Phase};
pub use error::{ConfigError, ControlError, InterceptorError, RuleError};
pub use interceptor::{Direction, InterceptorBackend, Packet, PacketInterceptor, QueueBackend};
pub use monitor::{FilterSession, StopReport};
pub use scoring::{Classification, Verdict};
pub use state::{CoreState, Counters};
pub use status::{StatusMessage, StatusSink};
