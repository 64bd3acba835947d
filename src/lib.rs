pub mod config;
pub mod network;

pub use config::{DaemonConfig, IkeSettings};
pub use network::ike::child_create::{ChildCreate, TaskContext};
pub use network::ike::session::IkeDaemon;
pub use network::ike::IkeError;
