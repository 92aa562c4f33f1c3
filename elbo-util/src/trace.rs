use candle_core::{Result, Tensor};
use fnv::FnvHashMap as HashMap;

use crate::log_prob::LogProb;

/// Whether a node was drawn by ancestral sampling or fixed to an
/// observed value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeStatus {
    Sampled,
    Conditioned,
}

/// A named random variable recorded in a trace
#[derive(Clone, Debug)]
pub struct Node {
    pub status: NodeStatus,
    pub log_prob: LogProb,
    /// the sampled or observed value, if the producer kept it
    pub value: Option<Tensor>,
}

impl Node {
    pub fn sampled(value: Option<Tensor>, log_prob: LogProb) -> Self {
        Self {
            status: NodeStatus::Sampled,
            log_prob,
            value,
        }
    }

    pub fn conditioned(value: Option<Tensor>, log_prob: LogProb) -> Self {
        Self {
            status: NodeStatus::Conditioned,
            log_prob,
            value,
        }
    }

    pub fn is_conditioned(&self) -> bool {
        self.status == NodeStatus::Conditioned
    }
}

/// What the estimators need to know about a trace.
///
/// Anything that can list its variables, tell observed from sampled ones
/// and hand out per-variable log-densities can be fed to
/// [`crate::montecarlo`].
pub trait TraceT {
    /// All variable names, in insertion order
    fn names(&self) -> Vec<&str>;

    fn contains(&self, name: &str) -> bool;

    /// Names of observed (fixed) variables
    fn conditioned(&self) -> Vec<&str>;

    /// Names of latent variables drawn by ancestral sampling
    fn sampled(&self) -> Vec<&str>;

    /// Log-density of a variable; `None` if the trace has no such name
    fn log_density(&self, name: &str) -> Option<&LogProb>;
}

/// Ordered mapping from variable name to [`Node`]
#[derive(Clone, Debug, Default)]
pub struct Trace {
    names: Vec<Box<str>>,
    nodes: HashMap<Box<str>, Node>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Add a node; a name can only be recorded once per trace
    pub fn insert(&mut self, name: &str, node: Node) -> Result<()> {
        if self.nodes.contains_key(name) {
            candle_core::bail!("trace already has a node named `{}`", name);
        }
        self.names.push(name.into());
        self.nodes.insert(name.into(), node);
        Ok(())
    }

    /// Record a latent variable
    pub fn sample(&mut self, name: &str, value: Tensor, log_prob: impl Into<LogProb>) -> Result<()> {
        self.insert(name, Node::sampled(Some(value), log_prob.into()))
    }

    /// Record an observed variable
    pub fn observe(&mut self, name: &str, value: Tensor, log_prob: impl Into<LogProb>) -> Result<()> {
        self.insert(name, Node::conditioned(Some(value), log_prob.into()))
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Value of a node, if it was recorded with one
    pub fn value(&self, name: &str) -> Option<&Tensor> {
        self.nodes.get(name).and_then(|n| n.value.as_ref())
    }

    fn names_with(&self, status: NodeStatus) -> Vec<&str> {
        self.names
            .iter()
            .filter(|n| self.nodes[&**n].status == status)
            .map(|n| &**n)
            .collect()
    }
}

impl TraceT for Trace {
    fn names(&self) -> Vec<&str> {
        self.names.iter().map(|n| &**n).collect()
    }

    fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    fn conditioned(&self) -> Vec<&str> {
        self.names_with(NodeStatus::Conditioned)
    }

    fn sampled(&self) -> Vec<&str> {
        self.names_with(NodeStatus::Sampled)
    }

    fn log_density(&self, name: &str) -> Option<&LogProb> {
        self.nodes.get(name).map(|n| &n.log_prob)
    }
}
