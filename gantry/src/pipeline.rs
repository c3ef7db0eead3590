//! Named DAGs of gated logic nodes with per-run tracing.
//!
//! Each [`LogicNode`] wraps a unit of logic in five gates:
//! `before` normalizes the input, `condition` decides whether `runner`
//! executes, `after` post-processes, and `selector` picks the follow-up
//! nodes. A run walks the DAG depth-first on a blocking worker, stamping
//! every node execution with a monotonic span and appending a
//! [`LogicResult`] audit record. Panics inside any gate are captured,
//! recorded with a `panic` outcome, and fail the run.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

use crate::errors::{Error, Result};

pub type NodeFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;
pub type CondFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
/// Picks the follow-up nodes from the executed node and its output.
/// `None` terminates the branch.
pub type SelectorFn = Arc<dyn Fn(&LogicNode, &Value) -> Option<Vec<Arc<LogicNode>>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeOutcome {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "condition not passed")]
    ConditionNotPassed,
    #[serde(rename = "panic")]
    Panic,
}

/// Audit record produced for every node execution.
#[derive(Debug, Clone, Serialize)]
pub struct LogicResult {
    #[serde(rename = "pipelineName")]
    pub pipeline_name: String,
    #[serde(rename = "nodeName")]
    pub node_name: String,
    #[serde(rename = "traceId")]
    pub trace_id: String,
    pub span: u64,
    pub start: i64,
    pub end: i64,
    pub outcome: NodeOutcome,
}

pub struct LogicNode {
    pub name: String,
    before: NodeFn,
    condition: CondFn,
    runner: NodeFn,
    after: NodeFn,
    selector: SelectorFn,
    pub children: Vec<Arc<LogicNode>>,
}

impl LogicNode {
    /// A pass-through node: identity gates, always-true condition, and a
    /// selector that follows `children`.
    pub fn new(name: &str) -> Self {
        LogicNode {
            name: name.to_string(),
            before: Arc::new(|x| x),
            condition: Arc::new(|_| true),
            runner: Arc::new(|x| x),
            after: Arc::new(|x| x),
            selector: Arc::new(|node, _| {
                if node.children.is_empty() {
                    None
                } else {
                    Some(node.children.clone())
                }
            }),
            children: Vec::new(),
        }
    }

    pub fn before(mut self, f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        self.before = Arc::new(f);
        self
    }

    pub fn condition(mut self, f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.condition = Arc::new(f);
        self
    }

    pub fn runner(mut self, f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        self.runner = Arc::new(f);
        self
    }

    pub fn after(mut self, f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        self.after = Arc::new(f);
        self
    }

    pub fn selector(mut self, f: impl Fn(&LogicNode, &Value) -> Option<Vec<Arc<LogicNode>>> + Send + Sync + 'static) -> Self {
        self.selector = Arc::new(f);
        self
    }

    pub fn child(mut self, node: LogicNode) -> Self {
        self.children.push(Arc::new(node));
        self
    }
}

pub struct Pipeline {
    pub name: String,
    pub root: Arc<LogicNode>,
    /// Expected node count, for progress estimation only.
    pub total_estimate: usize,
}

impl Pipeline {
    pub fn new(name: &str, root: LogicNode, total_estimate: usize) -> Self {
        Pipeline {
            name: name.to_string(),
            root: Arc::new(root),
            total_estimate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

struct RunInner {
    end_epoch: i64,
    status: RunStatus,
    current_span: u64,
    current_node: String,
    results: Vec<LogicResult>,
    output: Value,
}

/// One traversal of a pipeline's DAG, identified by its trace id.
pub struct PipelineRun {
    pub pipeline_name: String,
    pub trace_id: String,
    pub start_epoch: i64,
    span: AtomicU64,
    inner: RwLock<RunInner>,
}

impl PipelineRun {
    fn new(pipeline_name: &str, trace_id: String) -> Self {
        PipelineRun {
            pipeline_name: pipeline_name.to_string(),
            trace_id,
            start_epoch: chrono::Utc::now().timestamp_millis(),
            span: AtomicU64::new(0),
            inner: RwLock::new(RunInner {
                end_epoch: 0,
                status: RunStatus::Running,
                current_span: 0,
                current_node: String::new(),
                results: Vec::new(),
                output: Value::Null,
            }),
        }
    }

    pub fn status(&self) -> RunStatus {
        self.read().status
    }

    pub fn end_epoch(&self) -> i64 {
        self.read().end_epoch
    }

    pub fn current(&self) -> (u64, String) {
        let inner = self.read();
        (inner.current_span, inner.current_node.clone())
    }

    /// The audit trail so far, in completion order.
    pub fn results(&self) -> Vec<LogicResult> {
        self.read().results.clone()
    }

    /// The value propagated out of the last executed node.
    pub fn output(&self) -> Value {
        self.read().output.clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RunInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RunInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns the registered pipelines and their runs. Runs are dispatched
/// asynchronously; callers poll them back by trace id.
#[derive(Clone, Default)]
pub struct PipelineManager {
    pipelines: Arc<RwLock<HashMap<String, Arc<Pipeline>>>>,
    runs: Arc<RwLock<HashMap<String, Arc<PipelineRun>>>>,
}

impl PipelineManager {
    pub fn new() -> Self {
        PipelineManager::default()
    }

    pub fn register(&self, pipeline: Pipeline) {
        self.pipelines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pipeline.name.clone(), Arc::new(pipeline));
    }

    /// Start a run and return its trace id. Node gates may block, so the
    /// walk happens on a blocking worker; the engine itself never blocks.
    pub fn start(&self, name: &str, input: Value) -> Result<String> {
        let pipeline = self
            .pipelines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::PipelineNotFound(name.to_string()))?;

        let trace_id = Uuid::new_v4().to_string();
        let run = Arc::new(PipelineRun::new(&pipeline.name, trace_id.clone()));
        self.runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(trace_id.clone(), run.clone());

        info!(pipeline = %pipeline.name, trace_id = %trace_id, "pipeline run started");
        tokio::task::spawn_blocking(move || {
            let root = pipeline.root.clone();
            let walked = walk(&run, &root, input);
            let mut inner = run.write();
            inner.end_epoch = chrono::Utc::now().timestamp_millis();
            match walked {
                Ok(output) => {
                    inner.output = output;
                    inner.status = RunStatus::Success;
                }
                Err(node) => {
                    error!(pipeline = %run.pipeline_name, trace_id = %run.trace_id, %node, "pipeline node panicked");
                    inner.status = RunStatus::Failed;
                }
            }
        });
        Ok(trace_id)
    }

    pub fn run(&self, trace_id: &str) -> Option<Arc<PipelineRun>> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(trace_id)
            .cloned()
    }
}

/// Depth-first walk. Every follow-up branch receives the node's own output;
/// the value propagated out of the last executed node comes back, or the
/// name of the node that panicked.
fn walk(run: &Arc<PipelineRun>, node: &Arc<LogicNode>, input: Value) -> std::result::Result<Value, String> {
    let span = run.span.fetch_add(1, Ordering::SeqCst);
    {
        let mut inner = run.write();
        inner.current_span = span;
        inner.current_node = node.name.clone();
    }
    let start = chrono::Utc::now().timestamp_millis();

    let gates = {
        let node = node.clone();
        std::panic::catch_unwind(AssertUnwindSafe(move || {
            let parsed = (node.before)(input);
            if (node.condition)(&parsed) {
                (NodeOutcome::Success, (node.after)((node.runner)(parsed)))
            } else {
                (NodeOutcome::ConditionNotPassed, (node.after)(parsed))
            }
        }))
    };
    let end = chrono::Utc::now().timestamp_millis();

    let (outcome, value) = match gates {
        Ok(pair) => pair,
        Err(_) => {
            record(run, node, span, start, end, NodeOutcome::Panic);
            return Err(node.name.clone());
        }
    };
    record(run, node, span, start, end, outcome);

    if let Some(next) = (node.selector)(node, &value) {
        let mut last = value.clone();
        for child in next {
            last = walk(run, &child, value.clone())?;
        }
        return Ok(last);
    }
    Ok(value)
}

fn record(run: &Arc<PipelineRun>, node: &Arc<LogicNode>, span: u64, start: i64, end: i64, outcome: NodeOutcome) {
    run.write().results.push(LogicResult {
        pipeline_name: run.pipeline_name.clone(),
        node_name: node.name.clone(),
        trace_id: run.trace_id.clone(),
        span,
        start,
        end,
        outcome,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    async fn finished(manager: &PipelineManager, trace_id: &str) -> Arc<PipelineRun> {
        for _ in 0..100 {
            let run = manager.run(trace_id).unwrap();
            if run.status() != RunStatus::Running {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pipeline run never finished");
    }

    fn gated_pipeline() -> Pipeline {
        let child = LogicNode::new("increment").runner(|x| json!(x.as_i64().unwrap_or(0) + 1));
        let root = LogicNode::new("double")
            .condition(|x| x.as_i64().unwrap_or(0) > 0)
            .runner(|x| json!(x.as_i64().unwrap_or(0) * 2))
            .child(child);
        Pipeline::new("math", root, 2)
    }

    #[tokio::test]
    async fn passing_condition_runs_the_node_and_its_children() {
        let manager = PipelineManager::new();
        manager.register(gated_pipeline());

        let trace_id = manager.start("math", json!(3)).unwrap();
        let run = finished(&manager, &trace_id).await;

        assert_eq!(run.status(), RunStatus::Success);
        assert_eq!(run.output(), json!(7));
        let outcomes: Vec<NodeOutcome> = run.results().iter().map(|r| r.outcome).collect();
        assert_eq!(outcomes, vec![NodeOutcome::Success, NodeOutcome::Success]);
    }

    #[tokio::test]
    async fn failing_condition_skips_the_runner_but_flows_on() {
        let manager = PipelineManager::new();
        manager.register(gated_pipeline());

        let trace_id = manager.start("math", json!(0)).unwrap();
        let run = finished(&manager, &trace_id).await;

        let results = run.results();
        assert_eq!(results[0].outcome, NodeOutcome::ConditionNotPassed);
        // the gated runner never doubled, so the child incremented the raw 0
        assert_eq!(run.output(), json!(1));
    }

    #[tokio::test]
    async fn spans_are_monotonic_and_results_ordered() {
        let manager = PipelineManager::new();
        manager.register(gated_pipeline());

        let trace_id = manager.start("math", json!(5)).unwrap();
        let run = finished(&manager, &trace_id).await;

        let results = run.results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].span, 0);
        assert_eq!(results[1].span, 1);
        assert!(results.iter().all(|r| r.trace_id == trace_id));
        assert!(results.iter().all(|r| r.pipeline_name == "math"));
    }

    #[tokio::test]
    async fn every_sibling_receives_the_parents_output() {
        let plus_one = LogicNode::new("plus-one").runner(|x| json!(x.as_i64().unwrap_or(0) + 1));
        let times_ten = LogicNode::new("times-ten").runner(|x| json!(x.as_i64().unwrap_or(0) * 10));
        let root = LogicNode::new("double")
            .runner(|x| json!(x.as_i64().unwrap_or(0) * 2))
            .child(plus_one)
            .child(times_ten);
        let manager = PipelineManager::new();
        manager.register(Pipeline::new("fan-out", root, 3));

        let trace_id = manager.start("fan-out", json!(3)).unwrap();
        let run = finished(&manager, &trace_id).await;

        // both children see the root's 6, not each other's output
        assert_eq!(run.output(), json!(60));
        let results = run.results();
        assert_eq!(results.len(), 3);
        let spans: Vec<u64> = results.iter().map(|r| r.span).collect();
        assert_eq!(spans, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn selector_none_terminates_the_branch() {
        let skipped = LogicNode::new("never");
        let root = LogicNode::new("gate").selector(|_, _| None).child(skipped);
        let manager = PipelineManager::new();
        manager.register(Pipeline::new("short", root, 2));

        let trace_id = manager.start("short", json!("in")).unwrap();
        let run = finished(&manager, &trace_id).await;

        assert_eq!(run.results().len(), 1);
        assert_eq!(run.output(), json!("in"));
    }

    #[tokio::test]
    async fn panicking_node_fails_the_run_with_a_panic_outcome() {
        let root = LogicNode::new("fuse").runner(|_| panic!("node blew up"));
        let manager = PipelineManager::new();
        manager.register(Pipeline::new("volatile", root, 1));

        let trace_id = manager.start("volatile", json!(1)).unwrap();
        let run = finished(&manager, &trace_id).await;

        assert_eq!(run.status(), RunStatus::Failed);
        let results = run.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, NodeOutcome::Panic);
    }

    #[tokio::test]
    async fn unknown_pipeline_is_an_error() {
        let manager = PipelineManager::new();
        assert!(matches!(manager.start("ghost", json!(null)), Err(Error::PipelineNotFound(_))));
    }

    #[tokio::test]
    async fn before_and_after_wrap_the_runner() {
        let root = LogicNode::new("normalize")
            .before(|x| json!(x.as_str().unwrap_or("").trim()))
            .runner(|x| json!(format!("[{}]", x.as_str().unwrap_or(""))))
            .after(|x| json!(x.as_str().unwrap_or("").to_uppercase()));
        let manager = PipelineManager::new();
        manager.register(Pipeline::new("text", root, 1));

        let trace_id = manager.start("text", json!("  hi  ")).unwrap();
        let run = finished(&manager, &trace_id).await;
        assert_eq!(run.output(), json!("[HI]"));
    }
}
