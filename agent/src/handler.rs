use std::future::Future;

use homie_common::NodeRegistry;

/// Capabilities the host application plugs into the agent. Reserved
/// topics never reach `handle_command`; it only sees application
/// subtopics with the namespace prefix stripped.
pub trait AgentHandler: Send + Sync {
    /// Called once at startup to declare application nodes; the registry
    /// is frozen afterwards.
    fn register_nodes(&self, _registry: &mut NodeRegistry) {}

    fn handle_command(
        &self,
        subtopic: &str,
        payload: &[u8],
    ) -> impl Future<Output = ()> + Send;

    fn connection_changed(&self, _connected: bool) {}

    /// Coarse download progress, 0..=100.
    fn ota_progress(&self, _percent: u8) {}
}

/// Stand-alone agent with no application logic attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHandler;

impl AgentHandler for NullHandler {
    async fn handle_command(&self, subtopic: &str, _payload: &[u8]) {
        tracing::debug!("no application handler for command on {subtopic}");
    }
}
