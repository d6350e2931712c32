use async_trait::async_trait;
use recruitor_core::{Action, ActionSet, AgentDescriptor, Contract};
use recruitor_orchestrator::{Agent, WorkerConfig};
use serde_json::json;
use std::time::Duration;
use tracing::info;

/// A configured worker that answers every declared action by echoing the
/// payload back, after an optional delay.
pub struct EchoWorker {
    config: WorkerConfig,
}

impl EchoWorker {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Agent for EchoWorker {
    fn descriptor(&self) -> AgentDescriptor {
        let name = self.config.name.as_deref().unwrap_or(&self.config.id);
        AgentDescriptor::new(&self.config.id, name, &self.config.agent_type)
            .with_metadata("specializations", json!(self.config.specializations))
    }

    fn actions(&self) -> ActionSet {
        let delay = Duration::from_millis(self.config.delay_ms);
        self.config
            .actions
            .iter()
            .fold(ActionSet::new(), |set, action| {
                let worker = self.config.id.clone();
                let action_name = action.clone();
                set.with(
                    Action::from_fn(action.clone(), Contract::any(), Contract::any(), move |payload| {
                        let worker = worker.clone();
                        let action = action_name.clone();
                        async move {
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            Ok(json!({"worker": worker, "action": action, "payload": payload}))
                        }
                    })
                    .with_description(format!("Echo '{action}' payloads")),
                )
            })
    }

    async fn on_initialize(&self) -> recruitor_core::RecruitorResult<()> {
        info!(
            agent_id = %self.config.id,
            actions = ?self.config.actions,
            "Echo worker ready"
        );
        Ok(())
    }
}
