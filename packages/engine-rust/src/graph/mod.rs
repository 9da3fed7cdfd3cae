//! Route graphs.
//!
//! A route is an immutable graph of [`Node`]s assembled once by
//! [`RouteBuilder`](builder::RouteBuilder). Node kinds are a closed set;
//! only leaves carry open, adapter-provided logic (a [`Step`](step::Step)).
//!
//! - [`step`]: leaf step contract and built-in leaves
//! - [`predicate`]: choice and retry predicates
//! - [`aggregate`]: multicast aggregation strategies
//! - [`builder`]: assembly and validation

pub mod aggregate;
pub mod builder;
pub mod predicate;
pub mod step;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use switchyard_core::Exchange;

use self::aggregate::{AggregationStrategy, LastReplyWins};
use self::predicate::Predicate;
use self::step::Step;
use crate::redelivery::ScopeHandler;

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A node of an assembled route graph.
pub struct Node {
    id: String,
    kind: NodeKind,
}

pub enum NodeKind {
    Leaf(Leaf),
    /// Children run in order; each sees the previous child's output.
    Pipeline(Vec<Arc<Node>>),
    Multicast(Multicast),
    Choice(Choice),
    TryScope(TryScope),
}

impl Node {
    pub(crate) fn new(id: String, kind: NodeKind) -> Self {
        Self { id, kind }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    fn kind_name(&self) -> &'static str {
        match self.kind {
            NodeKind::Leaf(_) => "leaf",
            NodeKind::Pipeline(_) => "pipeline",
            NodeKind::Multicast(_) => "multicast",
            NodeKind::Choice(_) => "choice",
            NodeKind::TryScope(_) => "try",
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Node");
        s.field("id", &self.id).field("kind", &self.kind_name());
        match &self.kind {
            NodeKind::Leaf(_) => {}
            NodeKind::Pipeline(children) => {
                s.field("children", &children);
            }
            NodeKind::Multicast(m) => {
                s.field("children", &m.children);
            }
            NodeKind::Choice(c) => {
                s.field("branches", &c.branches).field("otherwise", &c.otherwise);
            }
            NodeKind::TryScope(t) => {
                s.field("body", &t.body).field("handler", &t.handler);
            }
        }
        s.finish()
    }
}

/// Leaf node: a step plus an optional deadline for its suspension.
pub struct Leaf {
    pub(crate) step: Arc<dyn Step>,
    pub(crate) timeout: Option<Duration>,
}

/// Multicast dispatch and aggregation settings.
#[derive(Clone)]
pub struct MulticastOptions {
    pub(crate) parallel: bool,
    pub(crate) fail_fast: bool,
    pub(crate) strategy: Arc<dyn AggregationStrategy>,
}

impl MulticastOptions {
    /// Sequential dispatch, no fail-fast, last reply wins.
    #[must_use]
    pub fn new() -> Self {
        Self {
            parallel: false,
            fail_fast: false,
            strategy: Arc::new(LastReplyWins),
        }
    }

    /// Dispatch every branch concurrently.
    #[must_use]
    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    /// Propagate the first branch failure immediately, discarding the
    /// results of branches still outstanding.
    #[must_use]
    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }

    #[must_use]
    pub fn strategy(mut self, strategy: impl AggregationStrategy + 'static) -> Self {
        self.strategy = Arc::new(strategy);
        self
    }
}

impl Default for MulticastOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MulticastOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MulticastOptions")
            .field("parallel", &self.parallel)
            .field("fail_fast", &self.fail_fast)
            .finish_non_exhaustive()
    }
}

pub struct Multicast {
    pub(crate) children: Vec<Arc<Node>>,
    pub(crate) options: MulticastOptions,
}

pub struct Choice {
    pub(crate) branches: Vec<(Predicate, Arc<Node>)>,
    pub(crate) otherwise: Option<Arc<Node>>,
}

impl Choice {
    /// First branch whose predicate holds, else the otherwise-branch.
    pub(crate) fn select(&self, exchange: &Exchange) -> Option<&Arc<Node>> {
        self.branches
            .iter()
            .find(|(predicate, _)| predicate.evaluate(exchange))
            .map(|(_, node)| node)
            .or(self.otherwise.as_ref())
    }
}

pub struct TryScope {
    pub(crate) body: Arc<Node>,
    pub(crate) handler: Arc<ScopeHandler>,
}

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

/// An assembled, validated route. Immutable and safe to share across any
/// number of concurrently routed exchanges.
pub struct Route {
    id: String,
    root: Arc<Node>,
    handler: Option<Arc<ScopeHandler>>,
    step_timeout: Option<Duration>,
    node_count: usize,
}

impl Route {
    pub(crate) fn new(
        id: String,
        root: Arc<Node>,
        handler: Option<Arc<ScopeHandler>>,
        step_timeout: Option<Duration>,
        node_count: usize,
    ) -> Self {
        Self {
            id,
            root,
            handler,
            step_timeout,
            node_count,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    /// The route-level error handler, protecting each leaf outside try-scopes.
    pub(crate) fn handler(&self) -> Option<&ScopeHandler> {
        self.handler.as_deref()
    }

    /// Deadline for suspended leaves that set none of their own.
    #[must_use]
    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.node_count
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("root", &self.root.id)
            .field("nodes", &self.node_count)
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}
