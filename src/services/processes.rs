use crate::error::{DStoreError, Result};
use crate::miners::ProcessDescriptor;
use crate::protocol::constants::{CommandName, PROCESS_TYPE, PROPERTY_TYPE};
use crate::services::connection::ClientConnection;
use crate::services::ProcessCapability;
use crate::store::Element;
use async_trait::async_trait;
use std::sync::Arc;

pub struct DStoreProcessService {
    conn: Arc<ClientConnection>,
}

impl DStoreProcessService {
    pub fn new(conn: Arc<ClientConnection>) -> Self {
        Self { conn }
    }

    /// Pid of the newest process the tracker has seen appear, if any.
    pub async fn newest(&self) -> Result<Option<String>> {
        let status = self.query().await?;
        Ok(status
            .children_of_type(PROPERTY_TYPE)
            .into_iter()
            .find(|p| p.name() == "newest")
            .map(|p| p.value()))
    }

    async fn query(&self) -> Result<Element> {
        let host = self.conn.store().host_root().clone();
        self.conn.run(CommandName::QueryProcesses.as_str(), &host, &[]).await
    }
}

fn descriptors(status: &Element) -> Vec<ProcessDescriptor> {
    status
        .children_of_type(PROCESS_TYPE)
        .into_iter()
        .map(|p| ProcessDescriptor::new(p.value(), p.name()))
        .collect()
}

#[async_trait]
impl ProcessCapability for DStoreProcessService {
    async fn list_processes(&self) -> Result<Vec<ProcessDescriptor>> {
        Ok(descriptors(&self.query().await?))
    }

    async fn kill(&self, target: &str) -> Result<ProcessDescriptor> {
        let host = self.conn.store().host_root().clone();
        let arg = self.conn.argument(target)?;
        let status = self.conn.run(CommandName::Kill.as_str(), &host, &[arg]).await?;
        descriptors(&status)
            .into_iter()
            .next()
            .ok_or_else(|| DStoreError::RemoteExecution(format!("kill of '{}' reported no process", target)))
    }
}
