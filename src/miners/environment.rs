use crate::dispatcher::{Invocation, Miner, MinerHandle};
use crate::error::{DStoreError, Result};
use crate::protocol::constants::{
    CommandName, ENVIRONMENT_MINER, ENVIRONMENT_TYPE, ENVIRONMENT_VARIABLE_TYPE, SYSTEM_ENVIRONMENT_NAME,
};
use crate::store::{DataStore, Element};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Publishes the host environment under its miner element.
pub struct EnvironmentMiner {
    variables: BTreeMap<String, String>,
}

impl EnvironmentMiner {
    /// Captures the current process environment.
    pub fn new() -> Self {
        Self::with_variables(std::env::vars())
    }

    pub fn with_variables(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            variables: vars.into_iter().collect(),
        }
    }
}

impl Default for EnvironmentMiner {
    fn default() -> Self {
        Self::new()
    }
}

impl Miner for EnvironmentMiner {
    fn id(&self) -> &'static str {
        ENVIRONMENT_MINER
    }

    fn commands(&self) -> &'static [CommandName] {
        &[]
    }

    fn activate(&self, store: &Arc<DataStore>, handle: &MinerHandle) -> Result<()> {
        let env = store.create(handle.element(), ENVIRONMENT_TYPE, SYSTEM_ENVIRONMENT_NAME, "")?;
        for (key, value) in &self.variables {
            store.create(&env, ENVIRONMENT_VARIABLE_TYPE, key, format!("{}={}", key, value))?;
        }
        debug!(count = self.variables.len(), "Published system environment");
        Ok(())
    }

    fn handle(&self, invocation: Invocation) {
        let name = invocation.command().to_string();
        invocation.finish(Err(DStoreError::UnknownCommand(name)));
    }
}

/// Reads `KEY=VALUE` entries from the `System Environment` element below
/// `miner_element`.
pub fn host_environment(miner_element: &Element) -> Vec<String> {
    miner_element
        .children_of_type(ENVIRONMENT_TYPE)
        .into_iter()
        .find(|e| e.name() == SYSTEM_ENVIRONMENT_NAME)
        .map(|env| {
            env.children_of_type(ENVIRONMENT_VARIABLE_TYPE)
                .iter()
                .map(Element::value)
                .collect()
        })
        .unwrap_or_default()
}
