//! Agent manager: routes inbound messages to agent loops.
//!
//! One loop per configured agent profile plus the default. Routing follows
//! the session's contact policy: a registered contact with a non-empty
//! `agent_id` goes to that profile; everything else, unknown profile ids
//! included, goes to the default loop.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::{InboundMessage, MessageBus, OutboundMessage};
use crate::config::Config;
use crate::contacts::ContactStore;
use crate::error::{Result, YoctoError};
use crate::providers::LLMProvider;

use super::AgentLoop;

/// Routes each inbound message to the right agent loop and publishes the
/// resulting reply.
pub struct AgentManager {
    bus: Arc<MessageBus>,
    contacts: Arc<ContactStore>,
    default_agent: String,
    agents: HashMap<String, Arc<AgentLoop>>,
}

impl AgentManager {
    /// Build one loop per configured profile (the default profile is
    /// synthesized when the config does not name it).
    pub async fn new(
        cfg: &Config,
        bus: Arc<MessageBus>,
        provider: Arc<dyn LLMProvider>,
        contacts: Arc<ContactStore>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let default_agent = cfg.default_agent_id().to_string();
        let mut agent_ids = cfg.agent_ids();
        if !agent_ids.contains(&default_agent) {
            agent_ids.push(default_agent.clone());
        }

        let mut agents = HashMap::new();
        for agent_id in &agent_ids {
            let profile = cfg.resolve_profile(agent_id);
            let agent = AgentLoop::new(
                profile,
                cfg.default_response(),
                Arc::clone(&bus),
                Arc::clone(&provider),
                Some(Arc::clone(&contacts)),
                cfg.contacts_only,
                cancel,
            )
            .await?;
            agents.insert(agent_id.clone(), agent);
        }

        info!(
            default_agent = %default_agent,
            agent_count = agents.len(),
            "Agent manager initialized"
        );

        Ok(Self {
            bus,
            contacts,
            default_agent,
            agents,
        })
    }

    /// The default agent loop.
    ///
    /// # Errors
    /// `NotFound` if construction somehow skipped the default profile.
    pub fn default_loop(&self) -> Result<&Arc<AgentLoop>> {
        self.agents
            .get(&self.default_agent)
            .ok_or_else(|| YoctoError::NotFound(format!("agent {}", self.default_agent)))
    }

    /// Consume the inbound queue until cancellation or bus close.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            let Some(msg) = self.bus.consume_inbound(&cancel).await else {
                info!("Inbound queue closed, agent manager stopping");
                break;
            };
            self.dispatch(&cancel, msg).await;
        }
    }

    /// Shut down every agent loop.
    pub async fn shutdown(&self) {
        for agent in self.agents.values() {
            agent.shutdown().await;
        }
    }

    async fn dispatch(&self, cancel: &CancellationToken, msg: InboundMessage) {
        let Ok(agent) = self.resolve_loop(&msg).await else {
            error!(session_key = %msg.session_key, "No agent loop available");
            return;
        };

        match agent.process(cancel, &msg).await {
            Ok(Some(reply)) if !reply.is_empty() => {
                agent
                    .publish_with_delay(
                        cancel,
                        OutboundMessage::new(&msg.channel, &msg.chat_id, &reply),
                        &msg.session_key,
                    )
                    .await;
            }
            Ok(_) => {}
            Err(e) => {
                error!(
                    session_key = %msg.session_key,
                    error = %e,
                    "Message processing failed"
                );
                let failure = OutboundMessage::new(
                    &msg.channel,
                    &msg.chat_id,
                    &format!("Error processing message: {}", e),
                );
                if let Err(publish_err) = self.bus.publish_outbound(failure).await {
                    warn!(error = %publish_err, "Failed to publish error reply");
                }
            }
        }
    }

    /// Resolve the loop for a message via its contact's `agent_id`.
    async fn resolve_loop(&self, msg: &InboundMessage) -> Result<&Arc<AgentLoop>> {
        let mut agent_id = self.default_agent.clone();
        if let Some(policy) = self.contacts.policy_for_session(&msg.session_key).await {
            if !policy.agent_id.is_empty() {
                agent_id = policy.agent_id;
            }
        }

        if let Some(agent) = self.agents.get(&agent_id) {
            return Ok(agent);
        }

        warn!(
            contact_agent_id = %agent_id,
            default_agent = %self.default_agent,
            session_key = %msg.session_key,
            "Unknown contact agent_id, falling back to default agent"
        );
        self.default_loop()
    }
}
