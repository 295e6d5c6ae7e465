use std::{
    collections::HashMap,
    fs,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock, RwLockReadGuard,
    },
};

use log::debug;
use petgraph::Graph as PetGraph;
use petgraph::{
    dot::{Config, Dot},
    graph::NodeIndex,
};

use super::{run_terminal, Rest, Transformation};
use crate::{Error, OpDef, OpKind, Result, SymbolicNode, TensorLayout, Value, ValueKind};

static GRAPH_ID: AtomicU64 = AtomicU64::new(1);

/// One variable of a [`ComputingGraph`].
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// Producing operator, `None` for captured inputs.
    pub op: Option<OpDef>,
    pub inputs: Vec<usize>,
    /// First node of the application that produced this one.
    pub group: usize,
    pub output_index: usize,
    pub layout: TensorLayout,
    /// Concrete value of a captured input.
    pub source: Option<Value>,
}

/// A symbolic dataflow graph built without touching device memory.
pub struct ComputingGraph {
    id: u64,
    nodes: RwLock<Vec<GraphNode>>,
}

impl ComputingGraph {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            nodes: RwLock::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn nodes(&self) -> RwLockReadGuard<'_, Vec<GraphNode>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.nodes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn symbolic(&self, node: usize, layout: TensorLayout) -> Value {
        Value::new(ValueKind::Symbolic(SymbolicNode {
            graph: self.id,
            node,
            layout,
        }))
    }

    fn push_input(&self, value: &Value) -> usize {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        let id = nodes.len();
        nodes.push(GraphNode {
            op: None,
            inputs: Vec::new(),
            group: id,
            output_index: 0,
            layout: value.layout(),
            source: Some(value.clone()),
        });
        id
    }

    /// Capture a concrete value as an input node.
    pub fn add_input(&self, value: &Value) -> Value {
        let id = self.push_input(value);
        self.symbolic(id, value.layout())
    }

    /// Add an application of `op`. Shape inference errors surface here.
    pub fn add_op(&self, op: &OpDef, inputs: &[usize]) -> Result<Vec<Value>> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        let layouts = inputs
            .iter()
            .map(|i| {
                nodes
                    .get(*i)
                    .map(|n| n.layout.clone())
                    .ok_or_else(|| Error::GraphMismatch(format!("node {i} is not in graph {}", self.id)))
            })
            .collect::<Result<Vec<_>>>()?;
        let (out_layouts, _) = op.infer_output_layouts(&layouts)?;
        let group = nodes.len();
        let mut created = Vec::with_capacity(out_layouts.len());
        for (output_index, layout) in out_layouts.into_iter().enumerate() {
            let id = nodes.len();
            nodes.push(GraphNode {
                op: Some(op.clone()),
                inputs: inputs.to_vec(),
                group,
                output_index,
                layout: layout.clone(),
                source: None,
            });
            created.push((id, layout));
        }
        drop(nodes);
        Ok(created
            .into_iter()
            .map(|(id, layout)| self.symbolic(id, layout))
            .collect())
    }

    /// Node id of `value` in this graph, capturing concrete values as inputs.
    pub fn resolve(&self, value: &Value) -> Result<usize> {
        let kind = value.kind().clone();
        match kind {
            ValueKind::Symbolic(n) if n.graph == self.id => Ok(n.node),
            ValueKind::Symbolic(n) => Err(Error::GraphMismatch(format!(
                "value #{} belongs to graph {}, not graph {}",
                value.id(),
                n.graph,
                self.id
            ))),
            ValueKind::Host(_) | ValueKind::Device(_) | ValueKind::Scalar(_) => {
                Ok(self.push_input(value))
            }
            other => Err(Error::GraphMismatch(format!(
                "{} value #{} cannot enter graph {}",
                other.tag(),
                value.id(),
                self.id
            ))),
        }
    }

    /// Compute the given nodes with `exec`, returning one value per node.
    pub fn evaluate(
        &self,
        targets: &[usize],
        exec: &dyn Fn(&OpDef, &[Value]) -> Result<Vec<Value>>,
    ) -> Result<Vec<Value>> {
        let nodes = self.nodes().clone();
        let mut done: HashMap<usize, Value> = HashMap::new();
        // Nodes are appended after their inputs, so ascending order is topological.
        let needed = {
            let mut needed = vec![false; nodes.len()];
            let mut stack: Vec<usize> = targets.to_vec();
            while let Some(i) = stack.pop() {
                if i >= nodes.len() || needed[i] {
                    continue;
                }
                needed[i] = true;
                stack.extend(&nodes[i].inputs);
                stack.push(nodes[i].group);
            }
            needed
        };
        for (i, node) in nodes.iter().enumerate() {
            if !needed[i] || done.contains_key(&i) {
                continue;
            }
            match (&node.op, &node.source) {
                (None, Some(source)) => {
                    done.insert(i, source.clone());
                }
                (Some(op), _) => {
                    let inputs: Vec<Value> = node
                        .inputs
                        .iter()
                        .map(|j| done[j].clone())
                        .collect();
                    let outputs = exec(op, &inputs)?;
                    for (k, out) in outputs.into_iter().enumerate() {
                        done.insert(node.group + k, out);
                    }
                }
                (None, None) => crate::bail!("graph node {i} has neither op nor source"),
            }
        }
        targets
            .iter()
            .map(|t| {
                done.get(t)
                    .cloned()
                    .ok_or_else(|| Error::msg(format!("graph node {t} was not computed")))
            })
            .collect()
    }

    /// Export as a petgraph with one node per variable.
    pub fn to_petgraph(&self) -> PetGraph<String, ()> {
        let nodes = self.nodes();
        let mut g = PetGraph::<String, ()>::new();
        let idx: Vec<NodeIndex> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| {
                let label = match &n.op {
                    Some(op) => format!("#{i} {op} -> {}", n.layout.signature()),
                    None => format!("#{i} input {}", n.layout.signature()),
                };
                g.add_node(label)
            })
            .collect();
        for (i, n) in nodes.iter().enumerate() {
            for src in &n.inputs {
                g.add_edge(idx[*src], idx[i], ());
            }
        }
        g
    }

    /// Produce a DOT format string of this graph.
    pub fn to_dot(&self) -> String {
        let g = self.to_petgraph();
        format!("{:?}", Dot::with_config(&g, &[Config::EdgeNoLabel]))
    }

    /// Write the DOT representation to a file.
    pub fn save_dot<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_dot())?;
        Ok(())
    }
}

fn handle_symbolic(graph: &ComputingGraph, op: &OpDef, inputs: &[Value]) -> Result<Vec<Value>> {
    match &op.kind {
        OpKind::Drop => return Ok(Vec::new()),
        OpKind::TraceMark { .. } | OpKind::Rename { .. } | OpKind::DetachGrad => {
            return Ok(inputs.to_vec())
        }
        _ => {}
    }
    let ids = inputs
        .iter()
        .map(|v| graph.resolve(v))
        .collect::<Result<Vec<_>>>()?;
    graph.add_op(op, &ids)
}

/// Eval-class layer that builds a symbolic graph instead of executing.
pub struct SymbolTransformation {
    graph: Arc<ComputingGraph>,
}

impl SymbolTransformation {
    pub fn new(graph: Arc<ComputingGraph>) -> Self {
        Self { graph }
    }

    pub fn graph(&self) -> &Arc<ComputingGraph> {
        &self.graph
    }
}

impl Transformation for SymbolTransformation {
    fn name(&self) -> String {
        format!("Symbol(graph {})", self.graph.id())
    }

    fn try_handle(&self, op: &OpDef, inputs: &[Value], _: &Rest<'_>) -> Result<Option<Vec<Value>>> {
        handle_symbolic(&self.graph, op, inputs).map(Some)
    }
}

/// Eval-class layer deferring execution: operators are recorded into a
/// graph and executed on `executor` when the layer is unregistered.
///
/// After execution every symbolic value the layer handed out is rebound to
/// its concrete result. Execution errors are kept until
/// [`LazyEvalTransformation::check_exception`] collects them.
pub struct LazyEvalTransformation {
    graph: Arc<ComputingGraph>,
    executor: Arc<dyn Transformation>,
    no_exec: bool,
    produced: Mutex<Vec<(Value, usize)>>,
    deferred: Mutex<Option<Error>>,
}

impl LazyEvalTransformation {
    pub fn new(executor: Arc<dyn Transformation>, no_exec: bool) -> Self {
        Self {
            graph: ComputingGraph::new(),
            executor,
            no_exec,
            produced: Mutex::new(Vec::new()),
            deferred: Mutex::new(None),
        }
    }

    pub fn graph(&self) -> &Arc<ComputingGraph> {
        &self.graph
    }

    /// Re-raise an error deferred from execution at exit.
    pub fn check_exception(&self) -> Result<()> {
        match self.deferred.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The node of this graph that `value` stands for, if any.
    fn node_of(&self, value: &Value) -> Option<usize> {
        match &*value.kind() {
            ValueKind::Symbolic(n) if n.graph == self.graph.id() => Some(n.node),
            _ => None,
        }
    }

    fn execute(&self, produced: &[(Value, usize)]) -> Result<()> {
        let targets: Vec<usize> = produced.iter().map(|(_, node)| *node).collect();
        let exec = |op: &OpDef, inputs: &[Value]| run_terminal(self.executor.as_ref(), op, inputs);
        let results = self.graph.evaluate(&targets, &exec)?;
        for ((v, _), r) in produced.iter().zip(results) {
            let kind = r.kind().clone();
            v.rebind(kind);
        }
        Ok(())
    }
}

impl Transformation for LazyEvalTransformation {
    fn name(&self) -> String {
        format!("LazyEval(graph {})", self.graph.id())
    }

    fn try_handle(&self, op: &OpDef, inputs: &[Value], _: &Rest<'_>) -> Result<Option<Vec<Value>>> {
        let outputs = handle_symbolic(&self.graph, op, inputs)?;
        // Control ops pass their inputs through; only new graph nodes get rebound.
        let recorded: Vec<(Value, usize)> = outputs
            .iter()
            .filter_map(|v| self.node_of(v).map(|node| (v.clone(), node)))
            .collect();
        self.produced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(recorded);
        Ok(Some(outputs))
    }

    fn on_unregister(&self) {
        let produced = std::mem::take(&mut *self.produced.lock().unwrap_or_else(|e| e.into_inner()));
        if self.no_exec {
            return;
        }
        debug!("lazy eval executing {} nodes", self.graph.len());
        if let Err(e) = self.execute(&produced) {
            *self.deferred.lock().unwrap_or_else(|e| e.into_inner()) = Some(e);
        }
    }
}
