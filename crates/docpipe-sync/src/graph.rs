//! A small dependency graph of named async tasks.
//!
//! Tasks run in topological layers; every task whose dependencies all
//! succeeded runs concurrently with the rest of its layer. A task with a failed
//! (or upstream-failed) dependency is marked `UpstreamFailed` and never runs.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use futures::future::{join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutput {
    Unit,
    Path(PathBuf),
    Flag(u8),
    Rows(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    UpstreamFailed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("task {0} is defined twice")]
    DuplicateTask(String),
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },
    #[error("tasks {0:?} form a dependency cycle")]
    Cycle(Vec<String>),
}

/// Outputs of a task's direct dependencies, keyed by task name.
#[derive(Debug, Clone, Default)]
pub struct Upstream(BTreeMap<String, TaskOutput>);

impl Upstream {
    pub fn get(&self, task: &str) -> Option<&TaskOutput> {
        self.0.get(task)
    }

    pub fn path(&self, task: &str) -> Result<PathBuf> {
        match self.get(task) {
            Some(TaskOutput::Path(path)) => Ok(path.clone()),
            other => Err(anyhow!("expected a path from {task}, got {other:?}")),
        }
    }
}

type TaskFn = Box<dyn Fn(Upstream) -> BoxFuture<'static, Result<TaskOutput>> + Send + Sync>;

struct TaskNode {
    name: String,
    deps: Vec<String>,
    run: TaskFn,
}

#[derive(Default)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
    progress: Mutex<Vec<TaskState>>,
}

#[derive(Debug)]
pub struct TaskFailure {
    pub task: String,
    pub error: anyhow::Error,
}

#[derive(Debug, Default)]
pub struct GraphRun {
    pub states: Vec<(String, TaskState)>,
    pub outputs: BTreeMap<String, TaskOutput>,
    pub failures: Vec<TaskFailure>,
}

impl GraphRun {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
            && self
                .states
                .iter()
                .all(|(_, state)| *state == TaskState::Succeeded)
    }

    pub fn state(&self, task: &str) -> Option<TaskState> {
        self.states
            .iter()
            .find(|(name, _)| name == task)
            .map(|(_, state)| *state)
    }

    pub fn output(&self, task: &str) -> Option<&TaskOutput> {
        self.outputs.get(task)
    }
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task<F, Fut>(&mut self, name: &str, deps: &[&str], run: F) -> Result<(), GraphError>
    where
        F: Fn(Upstream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskOutput>> + Send + 'static,
    {
        if self.nodes.iter().any(|n| n.name == name) {
            return Err(GraphError::DuplicateTask(name.to_string()));
        }
        self.nodes.push(TaskNode {
            name: name.to_string(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            run: Box::new(move |upstream| run(upstream).boxed()),
        });
        self.progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(TaskState::Pending);
        Ok(())
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    /// Node indices grouped into layers; every node comes after all of its dependencies.
    pub fn layers(&self) -> Result<Vec<Vec<usize>>, GraphError> {
        let index: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.as_str(), i))
            .collect();

        let mut indegree = vec![0usize; self.nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            for dep in &node.deps {
                let Some(&d) = index.get(dep.as_str()) else {
                    return Err(GraphError::UnknownDependency {
                        task: node.name.clone(),
                        dependency: dep.clone(),
                    });
                };
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut layers = Vec::new();
        let mut current: Vec<usize> = (0..self.nodes.len()).filter(|&i| indegree[i] == 0).collect();
        let mut placed = 0;
        while !current.is_empty() {
            placed += current.len();
            let mut next = Vec::new();
            for &i in &current {
                for &j in &dependents[i] {
                    indegree[j] -= 1;
                    if indegree[j] == 0 {
                        next.push(j);
                    }
                }
            }
            next.sort_unstable();
            layers.push(current);
            current = next;
        }

        if placed < self.nodes.len() {
            let stuck = (0..self.nodes.len())
                .filter(|&i| indegree[i] > 0)
                .map(|i| self.nodes[i].name.clone())
                .collect();
            return Err(GraphError::Cycle(stuck));
        }
        Ok(layers)
    }

    /// Current state of every task. Readable while a run is in flight or
    /// after it was dropped, e.g. on timeout.
    pub fn snapshot(&self) -> Vec<(String, TaskState)> {
        let progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        self.nodes
            .iter()
            .zip(progress.iter())
            .map(|(n, s)| (n.name.clone(), *s))
            .collect()
    }

    fn state_of(&self, i: usize) -> TaskState {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())[i]
    }

    fn set_state(&self, i: usize, state: TaskState) {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())[i] = state;
    }

    pub async fn run(&self) -> Result<GraphRun, GraphError> {
        let layers = self.layers()?;
        for i in 0..self.nodes.len() {
            self.set_state(i, TaskState::Pending);
        }
        let mut run = GraphRun::default();

        for layer in layers {
            let mut ready = Vec::new();
            for i in layer {
                let node = &self.nodes[i];
                let blocked = node.deps.iter().any(|dep| {
                    let d = self.nodes.iter().position(|n| &n.name == dep);
                    d.map(|d| self.state_of(d) != TaskState::Succeeded)
                        .unwrap_or(true)
                });
                if blocked {
                    self.set_state(i, TaskState::UpstreamFailed);
                    continue;
                }
                let upstream = Upstream(
                    node.deps
                        .iter()
                        .filter_map(|dep| {
                            run.outputs
                                .get(dep)
                                .map(|out| (dep.clone(), out.clone()))
                        })
                        .collect(),
                );
                self.set_state(i, TaskState::Running);
                ready.push((i, (node.run)(upstream)));
            }

            let (indices, futures): (Vec<_>, Vec<_>) = ready.into_iter().unzip();
            let results = join_all(futures).await;
            for (i, result) in indices.into_iter().zip(results) {
                let name = self.nodes[i].name.clone();
                match result {
                    Ok(output) => {
                        info!(task = %name, "task succeeded");
                        self.set_state(i, TaskState::Succeeded);
                        run.outputs.insert(name, output);
                    }
                    Err(err) => {
                        error!(task = %name, error = %format!("{err:#}"), "task failed");
                        self.set_state(i, TaskState::Failed);
                        run.failures.push(TaskFailure {
                            task: name,
                            error: err,
                        });
                    }
                }
            }
        }

        run.states = self.snapshot();
        Ok(run)
    }
}
