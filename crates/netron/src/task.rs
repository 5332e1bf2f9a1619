//! # Peer Tasks
//!
//! Named units of work a peer can ask a runtime to run on its behalf. Tasks
//! requested together run concurrently, and each one reports its own
//! outcome: a failing task never prevents the others from reporting.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use tracing::debug;

use crate::error::Error;
use crate::error::Result;
use crate::error::WireError;
use crate::netron::Netron;
use crate::peer::Peer;
use crate::value::Value;

/// Name of the task returning the runtime's options.
pub const CONFIG: &str = "config";
/// Name of the task returning every attached context's definition.
pub const CONTEXT_DEFS: &str = "contextDefs";

/// Tasks a runtime runs against every newly connected peer.
pub const CONNECT_TASKS: [&str; 2] = [CONFIG, CONTEXT_DEFS];

#[async_trait::async_trait]
pub trait Task: Send + Sync + 'static {
    async fn run(&self, netron: Arc<Netron>, peer: Arc<dyn Peer>, args: Vec<Value>) -> Result<Value>;
}

/// One task to run, with its arguments.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskRequest {
    pub task: String,
    pub args: Vec<Value>,
}

impl TaskRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self { task: task.into(), args: Vec::new() }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }
}

impl From<&str> for TaskRequest {
    fn from(task: &str) -> Self {
        Self::new(task)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TaskResult {
    Completed(Value),
    Failed(WireError),
}

impl TaskResult {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Completed(v) => Some(v),
            Self::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&WireError> {
        match self {
            Self::Completed(_) => None,
            Self::Failed(e) => Some(e),
        }
    }
}

pub type TaskResults = BTreeMap<String, TaskResult>;

/// Marks every requested task as failed with the same error.
pub(crate) fn fail_all(requests: &[TaskRequest], error: &Error) -> TaskResults {
    let wire = WireError::from(error);
    requests
        .iter()
        .map(|r| (r.task.clone(), TaskResult::Failed(wire.clone())))
        .collect()
}

/// Registry of the tasks a runtime knows how to run.
pub struct TaskManager {
    tasks: DashMap<String, Arc<dyn Task>>,
}

impl TaskManager {
    /// A manager preloaded with the connect tasks.
    pub fn new() -> Self {
        let manager = Self { tasks: DashMap::new() };
        manager.tasks.insert(CONFIG.to_string(), Arc::new(ConfigTask));
        manager.tasks.insert(CONTEXT_DEFS.to_string(), Arc::new(ContextDefsTask));
        manager
    }

    pub fn add(&self, name: &str, task: Arc<dyn Task>) -> Result<()> {
        match self.tasks.entry(name.to_string()) {
            Entry::Occupied(_) => Err(Error::Exists(format!("Task '{}' already exists", name))),
            Entry::Vacant(slot) => {
                slot.insert(task);
                Ok(())
            }
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Runs `requests` concurrently. Never fails as a whole.
    pub async fn run(
        &self,
        netron: Arc<Netron>,
        peer: Arc<dyn Peer>,
        requests: Vec<TaskRequest>,
    ) -> TaskResults {
        let mut results = TaskResults::new();
        let mut running = Vec::new();

        for request in requests {
            let Some(task) = self.tasks.get(&request.task).map(|t| t.value().clone()) else {
                let err = Error::NotExists(format!("Task '{}' is not exist", request.task));
                results.insert(request.task, TaskResult::Failed(WireError::from(&err)));
                continue;
            };
            let netron = netron.clone();
            let peer = peer.clone();
            running.push(async move {
                let outcome = task.run(netron, peer, request.args).await;
                (request.task, outcome)
            });
        }

        for (name, outcome) in join_all(running).await {
            let result = match outcome {
                Ok(value) => TaskResult::Completed(value),
                Err(e) => {
                    debug!(task = %name, error = %e, "task failed");
                    TaskResult::Failed(WireError::from(&e))
                }
            };
            results.insert(name, result);
        }

        results
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

struct ConfigTask;

#[async_trait::async_trait]
impl Task for ConfigTask {
    async fn run(&self, netron: Arc<Netron>, _peer: Arc<dyn Peer>, _args: Vec<Value>) -> Result<Value> {
        Ok(Value::from(serde_json::to_value(netron.options())?))
    }
}

struct ContextDefsTask;

#[async_trait::async_trait]
impl Task for ContextDefsTask {
    async fn run(&self, netron: Arc<Netron>, _peer: Arc<dyn Peer>, _args: Vec<Value>) -> Result<Value> {
        let defs = netron
            .context_names()
            .into_iter()
            .filter_map(|name| {
                let def = netron.context_definition(&name).ok()?;
                Some((name, Value::Definition(def)))
            });
        Ok(Value::map(defs))
    }
}
