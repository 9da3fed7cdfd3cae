//! Route assembly and validation.
//!
//! Nodes are declared by id and refer to each other by id. `build()` checks
//! the declarations and assembles the immutable graph:
//! 1. every reference resolves and no id is declared twice
//! 2. composites are non-empty
//! 3. no choice branch is shadowed by an earlier always-true predicate
//! 4. the graph is acyclic
//! 5. every node is reachable from the root or a route-level recovery node
//!
//! A node may be referenced from several parents; it is assembled once and
//! shared.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use switchyard_core::{ConfigurationError, Endpoint, Exchange, RouteError};
use tracing::error;

use super::predicate::Predicate;
use super::step::{CallbackStep, CompletionSignal, FnStep, ProducerStep, Step, StepContext};
use super::{Choice, Leaf, Multicast, MulticastOptions, Node, NodeKind, Route, TryScope};
use crate::redelivery::ErrorHandler;

enum Decl {
    Leaf {
        step: Arc<dyn Step>,
        timeout: Option<Duration>,
    },
    Pipeline(Vec<String>),
    Multicast {
        children: Vec<String>,
        options: MulticastOptions,
    },
    Choice {
        branches: Vec<(Predicate, String)>,
        otherwise: Option<String>,
    },
    TryScope {
        body: String,
        handler: ErrorHandler,
    },
}

impl Decl {
    /// Outgoing references, including a try-scope's recovery node.
    fn references(&self) -> Vec<&str> {
        match self {
            Decl::Leaf { .. } => Vec::new(),
            Decl::Pipeline(children) | Decl::Multicast { children, .. } => {
                children.iter().map(String::as_str).collect()
            }
            Decl::Choice { branches, otherwise } => branches
                .iter()
                .map(|(_, id)| id.as_str())
                .chain(otherwise.as_deref())
                .collect(),
            Decl::TryScope { body, handler } => std::iter::once(body.as_str())
                .chain(handler.recovery_target())
                .collect(),
        }
    }

    fn is_empty_composite(&self) -> bool {
        match self {
            Decl::Pipeline(children) | Decl::Multicast { children, .. } => children.is_empty(),
            Decl::Choice { branches, otherwise } => branches.is_empty() && otherwise.is_none(),
            Decl::Leaf { .. } | Decl::TryScope { .. } => false,
        }
    }

    /// Index of the first branch (counting otherwise as the last one) that
    /// an earlier always-true predicate makes unreachable.
    fn unreachable_branch(&self) -> Option<usize> {
        let Decl::Choice { branches, otherwise } = self else {
            return None;
        };
        let first_always = branches.iter().position(|(p, _)| p.is_always())?;
        let total = branches.len() + usize::from(otherwise.is_some());
        (first_always + 1 < total).then_some(first_always + 1)
    }
}

/// Assembles a [`Route`] from id-referenced node declarations.
///
/// ```
/// use switchyard_engine::graph::builder::RouteBuilder;
///
/// let route = RouteBuilder::new("orders")
///     .process("stamp", |ex, _ctx| {
///         ex.message_mut().set_header("stamped", true);
///         Ok(())
///     })
///     .pipeline("main", ["stamp"])
///     .root("main")
///     .build()
///     .unwrap();
/// assert_eq!(route.node_count(), 2);
/// ```
pub struct RouteBuilder {
    route_id: String,
    root: Option<String>,
    decls: Vec<(String, Decl)>,
    handler: Option<ErrorHandler>,
    step_timeout: Option<Duration>,
    deferred: Vec<ConfigurationError>,
}

impl RouteBuilder {
    #[must_use]
    pub fn new(route_id: impl Into<String>) -> Self {
        Self {
            route_id: route_id.into(),
            root: None,
            decls: Vec::new(),
            handler: None,
            step_timeout: None,
            deferred: Vec::new(),
        }
    }

    /// Sets the entry node.
    #[must_use]
    pub fn root(mut self, id: impl Into<String>) -> Self {
        self.root = Some(id.into());
        self
    }

    /// Route-level error handler. It protects every leaf outside a
    /// try-scope individually.
    #[must_use]
    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Deadline applied to suspended leaves that set none of their own.
    #[must_use]
    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    // -- leaves ------------------------------------------------------------

    #[must_use]
    pub fn step(self, id: impl Into<String>, step: impl Step + 'static) -> Self {
        self.declare(
            id,
            Decl::Leaf {
                step: Arc::new(step),
                timeout: None,
            },
        )
    }

    #[must_use]
    pub fn step_with_timeout(self, id: impl Into<String>, step: impl Step + 'static, timeout: Duration) -> Self {
        self.declare(
            id,
            Decl::Leaf {
                step: Arc::new(step),
                timeout: Some(timeout),
            },
        )
    }

    /// Synchronous leaf from a closure. Returning `Err` records the failure.
    #[must_use]
    pub fn process<F>(self, id: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Exchange, &StepContext<'_>) -> Result<(), RouteError> + Send + Sync + 'static,
    {
        self.step(id, FnStep::new(f))
    }

    /// Callback-style leaf; see [`CallbackStep`].
    #[must_use]
    pub fn callback<F>(self, id: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Exchange, CompletionSignal) + Send + Sync + 'static,
    {
        self.step(id, CallbackStep::new(f))
    }

    /// Leaf that sends to `endpoint`'s producer. An endpoint without a
    /// producer is reported by `build()`.
    #[must_use]
    pub fn to(mut self, id: impl Into<String>, endpoint: &Endpoint) -> Self {
        match endpoint.producer() {
            Ok(producer) => self.step(id, ProducerStep::new(producer)),
            Err(err) => {
                self.deferred.push(err);
                self
            }
        }
    }

    // -- composites --------------------------------------------------------

    #[must_use]
    pub fn pipeline<S: Into<String>>(self, id: impl Into<String>, children: impl IntoIterator<Item = S>) -> Self {
        let children = children.into_iter().map(Into::into).collect();
        self.declare(id, Decl::Pipeline(children))
    }

    #[must_use]
    pub fn multicast<S: Into<String>>(
        self,
        id: impl Into<String>,
        children: impl IntoIterator<Item = S>,
        options: MulticastOptions,
    ) -> Self {
        let children = children.into_iter().map(Into::into).collect();
        self.declare(id, Decl::Multicast { children, options })
    }

    /// Branches are tried in order; `otherwise` runs when none matches.
    #[must_use]
    pub fn choice<S: Into<String>>(
        self,
        id: impl Into<String>,
        branches: impl IntoIterator<Item = (Predicate, S)>,
        otherwise: Option<S>,
    ) -> Self {
        let branches = branches.into_iter().map(|(p, s)| (p, s.into())).collect();
        let otherwise = otherwise.map(Into::into);
        self.declare(id, Decl::Choice { branches, otherwise })
    }

    /// Runs `body` under `handler`, shadowing the route-level handler.
    #[must_use]
    pub fn try_scope(self, id: impl Into<String>, body: impl Into<String>, handler: ErrorHandler) -> Self {
        self.declare(
            id,
            Decl::TryScope {
                body: body.into(),
                handler,
            },
        )
    }

    fn declare(mut self, id: impl Into<String>, decl: Decl) -> Self {
        self.decls.push((id.into(), decl));
        self
    }

    // -- build -------------------------------------------------------------

    /// Validates the declarations and assembles the route.
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigurationError` found.
    pub fn build(self) -> Result<Route, ConfigurationError> {
        let route_id = self.route_id.clone();
        self.assemble().inspect_err(|err| {
            error!(route = %route_id, error = %err, "route rejected");
        })
    }

    fn assemble(self) -> Result<Route, ConfigurationError> {
        if let Some(err) = self.deferred.into_iter().next() {
            return Err(err);
        }

        let mut index: HashMap<&str, usize> = HashMap::with_capacity(self.decls.len());
        for (i, (id, _)) in self.decls.iter().enumerate() {
            if index.insert(id.as_str(), i).is_some() {
                return Err(ConfigurationError::DuplicateNodeId { id: id.clone() });
            }
        }

        let root_id = self.root.clone().ok_or_else(|| ConfigurationError::MissingRoot {
            route: self.route_id.clone(),
        })?;
        let lookup = |id: &str, referenced_by: &str| {
            index
                .get(id)
                .copied()
                .ok_or_else(|| ConfigurationError::UnknownNode {
                    id: id.to_string(),
                    referenced_by: referenced_by.to_string(),
                })
        };
        let root = lookup(&root_id, &self.route_id)?;
        let handler_target = match self.handler.as_ref().and_then(ErrorHandler::recovery_target) {
            Some(target) => Some(lookup(target, &self.route_id)?),
            None => None,
        };

        let mut edges: Vec<Vec<usize>> = Vec::with_capacity(self.decls.len());
        for (id, decl) in &self.decls {
            let targets = decl
                .references()
                .into_iter()
                .map(|target| lookup(target, id))
                .collect::<Result<Vec<_>, _>>()?;
            edges.push(targets);
        }

        for (id, decl) in &self.decls {
            if decl.is_empty_composite() {
                return Err(ConfigurationError::EmptyComposite { id: id.clone() });
            }
            if let Some(index) = decl.unreachable_branch() {
                return Err(ConfigurationError::UnreachableBranch {
                    choice: id.clone(),
                    index,
                });
            }
        }

        if let Some(cycle) = find_cycle(&edges) {
            let path = cycle.into_iter().map(|i| self.decls[i].0.clone()).collect();
            return Err(ConfigurationError::Cycle { path });
        }

        let reachable = reachable_from(&edges, std::iter::once(root).chain(handler_target));
        if let Some(i) = reachable.iter().position(|seen| !seen) {
            return Err(ConfigurationError::UnreachableNode {
                id: self.decls[i].0.clone(),
            });
        }

        let node_count = self.decls.len();
        let route_id = self.route_id;
        let route_handler = self.handler;
        let mut assembler = Assembler {
            decls: self
                .decls
                .into_iter()
                .map(|(id, decl)| (id, Some(decl)))
                .collect(),
            edges,
            built: vec![None; node_count],
        };
        let root = assembler.node(root)?;
        let handler = match route_handler {
            Some(handler) => {
                let target = handler_target.map(|i| assembler.node(i)).transpose()?;
                Some(Arc::new(handler.resolve(target)))
            }
            None => None,
        };

        Ok(Route::new(route_id, root, handler, self.step_timeout, node_count))
    }
}

/// Builds `Arc<Node>`s bottom-up, memoizing shared nodes.
struct Assembler {
    decls: Vec<(String, Option<Decl>)>,
    edges: Vec<Vec<usize>>,
    built: Vec<Option<Arc<Node>>>,
}

impl Assembler {
    fn node(&mut self, i: usize) -> Result<Arc<Node>, ConfigurationError> {
        if let Some(node) = &self.built[i] {
            return Ok(Arc::clone(node));
        }
        let (id, slot) = &mut self.decls[i];
        let id = id.clone();
        let decl = slot
            .take()
            .ok_or_else(|| ConfigurationError::Cycle { path: vec![id.clone()] })?;
        let targets = self.edges[i].clone();
        let mut children = targets.into_iter().map(|t| self.node(t)).collect::<Result<Vec<_>, _>>()?;

        let kind = match decl {
            Decl::Leaf { step, timeout } => NodeKind::Leaf(Leaf { step, timeout }),
            Decl::Pipeline(_) => NodeKind::Pipeline(children),
            Decl::Multicast { options, .. } => NodeKind::Multicast(Multicast { children, options }),
            Decl::Choice { branches, .. } => {
                let otherwise = (children.len() > branches.len()).then(|| children.remove(branches.len()));
                let branches = branches
                    .into_iter()
                    .map(|(predicate, _)| predicate)
                    .zip(children)
                    .collect();
                NodeKind::Choice(Choice { branches, otherwise })
            }
            Decl::TryScope { handler, .. } => {
                let mut children = children.into_iter();
                let body = children
                    .next()
                    .ok_or_else(|| ConfigurationError::EmptyComposite { id: id.clone() })?;
                NodeKind::TryScope(TryScope {
                    body,
                    handler: Arc::new(handler.resolve(children.next())),
                })
            }
        };

        let node = Arc::new(Node::new(id, kind));
        self.built[i] = Some(Arc::clone(&node));
        Ok(node)
    }
}

/// Returns the node indices of one cycle, first node repeated at the end.
fn find_cycle(edges: &[Vec<usize>]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        New,
        Active,
        Done,
    }

    let mut marks = vec![Mark::New; edges.len()];
    for start in 0..edges.len() {
        if marks[start] != Mark::New {
            continue;
        }
        // (node, next edge to explore)
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        marks[start] = Mark::Active;
        while let Some(top) = stack.last_mut() {
            let (node, edge) = *top;
            top.1 += 1;
            if let Some(&target) = edges[node].get(edge) {
                match marks[target] {
                    Mark::New => {
                        marks[target] = Mark::Active;
                        stack.push((target, 0));
                    }
                    Mark::Active => {
                        let from = stack.iter().position(|(n, _)| *n == target).unwrap_or(0);
                        let mut path: Vec<usize> = stack[from..].iter().map(|(n, _)| *n).collect();
                        path.push(target);
                        return Some(path);
                    }
                    Mark::Done => {}
                }
            } else {
                marks[node] = Mark::Done;
                stack.pop();
            }
        }
    }
    None
}

fn reachable_from(edges: &[Vec<usize>], roots: impl IntoIterator<Item = usize>) -> Vec<bool> {
    let mut seen = vec![false; edges.len()];
    let mut pending: Vec<usize> = roots.into_iter().collect();
    while let Some(node) = pending.pop() {
        if std::mem::replace(&mut seen[node], true) {
            continue;
        }
        pending.extend(edges[node].iter().copied().filter(|t| !seen[*t]));
    }
    seen
}
