pub mod command;
pub mod environment;
pub mod filesystem;
pub mod process;

pub use command::{CommandMiner, ExecSpec};
pub use environment::{host_environment, EnvironmentMiner};
pub use filesystem::{element_path, FileProperties, FileSystemMiner};
pub use process::{ProcessDescriptor, ProcessMiner, ProcessTable, ProcessTracker};

use crate::config::Config;
use crate::dispatcher::CommandDispatcher;
use crate::error::Result;
use std::sync::Arc;

/// Registers the standard miner set. The returned tracker must be attached to
/// the scheduler so it can refresh after kills.
pub fn register_defaults(dispatcher: &CommandDispatcher, config: &Config) -> Result<ProcessTracker> {
    let tracker = ProcessTracker::new(config);
    dispatcher.register_miner(Arc::new(EnvironmentMiner::new()))?;
    dispatcher.register_miner(Arc::new(CommandMiner::new(config.files_root.clone())))?;
    dispatcher.register_miner(Arc::new(ProcessMiner::new(tracker.clone())))?;
    dispatcher.register_miner(Arc::new(FileSystemMiner::new(
        config.files_root.clone(),
        config.system_encoding.clone(),
    )))?;
    Ok(tracker)
}
