use std::sync::Arc;

use baton_core::domain::agent::{Agent, AgentRegistry};
use baton_core::domain::handoff::{parse_transfer_call, HandoffRequest};
use baton_core::domain::tool::ToolCallRequest;
use baton_core::errors::RoutingError;

#[derive(Clone, Debug)]
pub enum RoutedAgent {
    Switched(Arc<Agent>),
    /// The request named the current agent.
    Unchanged,
}

/// Validates transfers against the run's registry and the current agent's permitted targets.
#[derive(Clone, Debug)]
pub struct HandoffRouter {
    registry: AgentRegistry,
}

impl HandoffRouter {
    pub fn new(registry: AgentRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn route(
        &self,
        current: &Agent,
        request: &HandoffRequest,
    ) -> Result<RoutedAgent, RoutingError> {
        let target = request.target_agent_name.as_str();
        if target == current.name() {
            return Ok(RoutedAgent::Unchanged);
        }

        let Some(agent) = self.registry.get(target) else {
            return Err(RoutingError::UnknownAgent { target: target.to_owned() });
        };
        if !current.can_hand_off_to(target) {
            return Err(RoutingError::TargetNotPermitted {
                from: current.name().to_owned(),
                target: target.to_owned(),
            });
        }

        Ok(RoutedAgent::Switched(agent))
    }
}

/// The first `transfer_to_*` call of a response, with its position among the response's calls.
/// Later transfer calls in the same response are not honoured.
pub fn first_transfer(tool_calls: &[ToolCallRequest]) -> Option<(usize, HandoffRequest)> {
    tool_calls
        .iter()
        .enumerate()
        .find_map(|(index, call)| parse_transfer_call(call).map(|request| (index, request)))
}
