use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::domain::handoff::TRANSFER_TOOL_PREFIX;
use crate::domain::tool::{Tool, ToolSchema};
use crate::errors::{AgentDefinitionError, RegistryError};

pub const DEFAULT_MAX_TURNS: u32 = 10;

/// Immutable agent definition. Built through [`AgentBuilder`] and shared as `Arc<Agent>`.
#[derive(Clone)]
pub struct Agent {
    name: String,
    instructions: String,
    model: String,
    tools: Vec<Arc<dyn Tool>>,
    handoff_targets: Vec<String>,
    max_turns: u32,
    parallel_tool_calls: bool,
}

impl Agent {
    pub fn builder(name: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn tool(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|tool| tool.name() == name)
    }

    pub fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|tool| tool.descriptor()).collect()
    }

    pub fn handoff_targets(&self) -> &[String] {
        &self.handoff_targets
    }

    pub fn can_hand_off_to(&self, target: &str) -> bool {
        self.handoff_targets.iter().any(|candidate| candidate == target)
    }

    pub fn max_turns(&self) -> u32 {
        self.max_turns
    }

    pub fn parallel_tool_calls(&self) -> bool {
        self.parallel_tool_calls
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("tools", &self.tools.iter().map(|tool| tool.name()).collect::<Vec<_>>())
            .field("handoff_targets", &self.handoff_targets)
            .field("max_turns", &self.max_turns)
            .field("parallel_tool_calls", &self.parallel_tool_calls)
            .finish()
    }
}

pub struct AgentBuilder {
    name: String,
    instructions: String,
    model: String,
    tools: Vec<Arc<dyn Tool>>,
    handoff_targets: Vec<String>,
    max_turns: u32,
    parallel_tool_calls: bool,
}

impl AgentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: String::new(),
            model: String::new(),
            tools: Vec::new(),
            handoff_targets: Vec::new(),
            max_turns: DEFAULT_MAX_TURNS,
            parallel_tool_calls: true,
        }
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn tool(self, tool: impl Tool + 'static) -> Self {
        self.tool_arc(Arc::new(tool))
    }

    pub fn tool_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Repeated targets are kept once, in first-seen order.
    pub fn handoff_to(mut self, target: impl Into<String>) -> Self {
        let target = target.into();
        if !self.handoff_targets.contains(&target) {
            self.handoff_targets.push(target);
        }
        self
    }

    pub fn max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn parallel_tool_calls(mut self, parallel: bool) -> Self {
        self.parallel_tool_calls = parallel;
        self
    }

    pub fn build(self) -> Result<Agent, AgentDefinitionError> {
        let name = self.name.trim().to_owned();
        if name.is_empty() {
            return Err(AgentDefinitionError::EmptyName);
        }
        if self.model.trim().is_empty() {
            return Err(AgentDefinitionError::EmptyModel { agent: name });
        }
        if self.max_turns == 0 {
            return Err(AgentDefinitionError::ZeroMaxTurns { agent: name });
        }

        let mut seen = BTreeSet::new();
        for tool in &self.tools {
            let tool_name = tool.name();
            if tool_name.starts_with(TRANSFER_TOOL_PREFIX) {
                return Err(AgentDefinitionError::ReservedToolName {
                    agent: name,
                    tool: tool_name.to_owned(),
                });
            }
            if !seen.insert(tool_name) {
                return Err(AgentDefinitionError::DuplicateTool {
                    agent: name,
                    tool: tool_name.to_owned(),
                });
            }
        }

        Ok(Agent {
            name,
            instructions: self.instructions,
            model: self.model,
            tools: self.tools,
            handoff_targets: self.handoff_targets,
            max_turns: self.max_turns,
            parallel_tool_calls: self.parallel_tool_calls,
        })
    }
}

/// Immutable snapshot of agents keyed by name.
#[derive(Clone, Debug, Default)]
pub struct AgentRegistry {
    agents: Arc<BTreeMap<String, Arc<Agent>>>,
}

impl AgentRegistry {
    pub fn builder() -> AgentRegistryBuilder {
        AgentRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Returns a new registry with `agent` added or replaced; `self` is unchanged.
    pub fn with_agent(&self, agent: Agent) -> Result<Self, RegistryError> {
        let mut agents = (*self.agents).clone();
        agents.insert(agent.name().to_owned(), Arc::new(agent));
        validate_targets(&agents)?;
        Ok(Self { agents: Arc::new(agents) })
    }
}

#[derive(Default)]
pub struct AgentRegistryBuilder {
    agents: Vec<Agent>,
}

impl AgentRegistryBuilder {
    pub fn register(mut self, agent: Agent) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn build(self) -> Result<AgentRegistry, RegistryError> {
        let mut agents = BTreeMap::new();
        for agent in self.agents {
            let name = agent.name().to_owned();
            if agents.contains_key(&name) {
                return Err(RegistryError::DuplicateAgent(name));
            }
            agents.insert(name, Arc::new(agent));
        }
        validate_targets(&agents)?;
        Ok(AgentRegistry { agents: Arc::new(agents) })
    }
}

fn validate_targets(agents: &BTreeMap<String, Arc<Agent>>) -> Result<(), RegistryError> {
    for agent in agents.values() {
        if let Some(target) =
            agent.handoff_targets().iter().find(|target| !agents.contains_key(target.as_str()))
        {
            return Err(RegistryError::UnknownHandoffTarget {
                agent: agent.name().to_owned(),
                target: target.clone(),
            });
        }
    }
    Ok(())
}
