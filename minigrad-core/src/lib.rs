//!
//! # minigrad-core
//!
//! Reverse-mode automatic differentiation over a graph of [`Variable`] nodes.
//!
//! A forward computation builds a DAG of variables, each recording the inputs
//! that produced it and a [`Context`] of saved forward values. A single call
//! to [`backpropagate`] with a root node and a seed derivative orders the
//! graph with [`topological_sort`] and walks it once, depositing the total
//! derivative into every reachable leaf's accumulator.
//!
//! ## Preconditions
//!
//! The engine validates nothing at runtime; callers uphold:
//!
//! 1. The non-constant subgraph reachable from the root is acyclic
//! 2. The root itself is not constant
//! 3. Node ids are issued through [`next_node_id`], never invented
//!

use std::sync::atomic::{AtomicU64, Ordering};

use noether::operations::ClosedAddAssign;

use num_traits::Zero;

use rustc_hash::{FxHashMap, FxHashSet};

use smallvec::SmallVec;

/// Identity of a graph node; the sole key for visited sets and derivative
/// accumulation maps.
pub type NodeId = u64;

static NODE_COUNT: AtomicU64 = AtomicU64::new(1);

/// Issue the next process-wide node id.
///
/// Strictly increasing for the lifetime of the process; assignment order
/// carries no meaning beyond uniqueness. Safe under concurrent node
/// construction.
#[inline]
pub fn next_node_id() -> NodeId {
  NODE_COUNT.fetch_add(1, Ordering::Relaxed)
}

/// Per-operation-application record of the forward-pass values the backward
/// rule will need, gated by `no_grad`.
///
/// Owned exclusively by the node whose operation created it; written once,
/// read during the backward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Context<T> {
  no_grad: bool,
  saved_values: SmallVec<[T; 2]>,
}

impl<T> Context<T> {
  /// A context with gradient tracking enabled.
  pub fn new() -> Self {
    Self {
      no_grad: false,
      saved_values: SmallVec::new(),
    }
  }

  /// A context with gradient tracking disabled; [`Context::save_for_backward`]
  /// becomes a no-op.
  pub fn no_grad() -> Self {
    Self {
      no_grad: true,
      saved_values: SmallVec::new(),
    }
  }

  #[inline]
  pub fn is_no_grad(&self) -> bool {
    self.no_grad
  }

  /// Store the values needed during backpropagation.
  ///
  /// Silently dropped when `no_grad` is set. Last call wins, though by
  /// convention an operation calls this at most once.
  pub fn save_for_backward<I>(&mut self, values: I)
  where
    I: IntoIterator<Item = T>,
  {
    if self.no_grad {
      return;
    }
    self.saved_values = values.into_iter().collect();
  }

  /// The stored values; empty if never saved.
  #[inline]
  pub fn saved_tensors(&self) -> &[T] {
    &self.saved_values
  }
}

impl<T> Default for Context<T> {
  fn default() -> Self {
    Self::new()
  }
}

/// Capability contract every graph node satisfies.
///
/// Implementations are cheap-to-clone handles (the engine clones them into
/// its work structures), with node state shared behind the handle.
pub trait Variable: Clone {
  /// The derivative value flowing along graph edges. `Zero` supplies the
  /// additive identity for nodes no contribution has reached yet, and
  /// accumulation relies on addition being commutative and associative over
  /// this type.
  type Value: ClosedAddAssign + Zero + Clone;

  /// Process-wide unique id, assigned at construction via [`next_node_id`].
  fn unique_id(&self) -> NodeId;

  /// True iff this node has no producing operation (an original input).
  /// Gradients terminate and accumulate here.
  fn is_leaf(&self) -> bool;

  /// True iff this node is excluded from differentiation entirely. Constants
  /// are never visited by the sorter and never receive gradient.
  fn is_constant(&self) -> bool;

  /// Direct inputs of the operation that produced this node; empty for
  /// leaves and constants.
  fn parents(&self) -> SmallVec<[Self; 2]>;

  /// Distribute an incoming gradient to the parents that require one,
  /// applying the producing operation's local derivative rule to the values
  /// its [`Context`] saved.
  fn chain_rule(&self, d_output: &Self::Value) -> SmallVec<[(Self, Self::Value); 2]>;

  /// Add `d` into this node's persistent derivative accumulator.
  ///
  /// Defined only for leaves; implementations assert it.
  fn accumulate_derivative(&self, d: Self::Value);
}

/// Order the non-constant ancestry of `root` so that every node appears
/// strictly after all nodes that depend on it; `root` comes first.
///
/// Shared ancestors (diamond shapes) appear exactly once. Constant parents
/// are pruned at the edge and never enter the visited set.
pub fn topological_sort<V>(root: &V) -> Vec<V>
where
  V: Variable,
{
  let mut stack: Vec<(V, bool)> = Vec::new();
  let mut post: Vec<V> = Vec::new();
  let mut visited: FxHashSet<NodeId> = FxHashSet::default();

  stack.push((root.clone(), false));

  // linear dfs; the recursive formulation overflows on deep chains
  while let Some((node, children_pushed)) = stack.pop() {
    if children_pushed {
      // all parents finalized, emit in postorder
      post.push(node);
    } else if visited.insert(node.unique_id()) {
      // marker to emit the node once its parents are done
      stack.push((node.clone(), true));
      // reversed so the first parent is processed first; sibling order only
      // affects traversal determinism, never the result
      for parent in node.parents().into_iter().rev() {
        if !parent.is_constant() && !visited.contains(&parent.unique_id()) {
          stack.push((parent, false));
        }
      }
    }
  }

  post.reverse();
  post
}

/// Run one backward pass from `root`, seeded with `seed`.
///
/// Walks the topological order root-first, keeping an accumulation map from
/// node id to total incoming derivative. Leaves receive exactly one terminal
/// [`Variable::accumulate_derivative`] call per pass; interior nodes
/// redistribute their total through [`Variable::chain_rule`], summing
/// multiple contributions to the same parent.
///
/// Contributions a `chain_rule` emits for constant parents land in the map
/// but are never processed, since constants never appear in the order.
pub fn backpropagate<V>(root: &V, seed: V::Value)
where
  V: Variable,
{
  let order = topological_sort(root);

  let mut derivatives: FxHashMap<NodeId, V::Value> = FxHashMap::default();
  derivatives.insert(root.unique_id(), seed);

  for node in order {
    let d = derivatives
      .get(&node.unique_id())
      .cloned()
      .unwrap_or_else(V::Value::zero);

    if node.is_leaf() {
      node.accumulate_derivative(d);
    } else {
      for (parent, grad) in node.chain_rule(&d) {
        derivatives
          .entry(parent.unique_id())
          .and_modify(|g| {
            *g += grad.clone();
          })
          .or_insert(grad);
      }
    }
  }
}

/// Conventional perturbation for [`central_difference`].
pub const DEFAULT_EPSILON: f64 = 1e-6;

/// Symmetric finite-difference approximation of the derivative of `f` with
/// respect to its `arg`-th positional value.
///
/// A test oracle for cross-checking analytic gradients; not on any
/// production path.
pub fn central_difference<F>(f: F, vals: &[f64], arg: usize, epsilon: f64) -> f64
where
  F: Fn(&[f64]) -> f64,
{
  let mut upper = vals.to_vec();
  let mut lower = vals.to_vec();
  upper[arg] += epsilon;
  lower[arg] -= epsilon;
  (f(&upper) - f(&lower)) / (2.0 * epsilon)
}

#[cfg(test)]
mod tests {
  use super::*;

  use std::cell::Cell;
  use std::rc::Rc;

  /// Minimal node type exercising the contract: each edge carries a fixed
  /// local partial, so expected gradients are products of edge weights
  /// summed over paths.
  #[derive(Clone)]
  struct Probe {
    inner: Rc<ProbeInner>,
  }

  struct ProbeInner {
    id: NodeId,
    kind: Kind,
    // (parent, local partial) per incoming edge
    edges: Vec<(Probe, f64)>,
    accumulated: Cell<f64>,
    terminal_calls: Cell<u32>,
  }

  #[derive(PartialEq)]
  enum Kind {
    Leaf,
    Constant,
    Op,
  }

  impl Probe {
    fn leaf() -> Self {
      Self::with_kind(Kind::Leaf, Vec::new())
    }

    fn constant() -> Self {
      Self::with_kind(Kind::Constant, Vec::new())
    }

    fn op(edges: Vec<(Probe, f64)>) -> Self {
      Self::with_kind(Kind::Op, edges)
    }

    fn with_kind(kind: Kind, edges: Vec<(Probe, f64)>) -> Self {
      Probe {
        inner: Rc::new(ProbeInner {
          id: next_node_id(),
          kind,
          edges,
          accumulated: Cell::new(0.0),
          terminal_calls: Cell::new(0),
        }),
      }
    }

    fn accumulated(&self) -> f64 {
      self.inner.accumulated.get()
    }

    fn terminal_calls(&self) -> u32 {
      self.inner.terminal_calls.get()
    }
  }

  impl Variable for Probe {
    type Value = f64;

    fn unique_id(&self) -> NodeId {
      self.inner.id
    }

    fn is_leaf(&self) -> bool {
      self.inner.kind == Kind::Leaf
    }

    fn is_constant(&self) -> bool {
      self.inner.kind == Kind::Constant
    }

    fn parents(&self) -> SmallVec<[Self; 2]> {
      self.inner.edges.iter().map(|(p, _)| p.clone()).collect()
    }

    fn chain_rule(&self, d_output: &f64) -> SmallVec<[(Self, f64); 2]> {
      // deliberately unfiltered: constant parents are emitted too, the
      // engine tolerates them because the sorter never schedules them
      self
        .inner
        .edges
        .iter()
        .map(|(p, w)| (p.clone(), w * d_output))
        .collect()
    }

    fn accumulate_derivative(&self, d: f64) {
      assert!(self.is_leaf(), "terminal accumulation on a non-leaf");
      self.inner.accumulated.set(self.inner.accumulated.get() + d);
      self.inner.terminal_calls.set(self.inner.terminal_calls.get() + 1);
    }
  }

  mod context {
    use super::*;

    #[test]
    fn saves_and_reads() {
      let mut ctx: Context<f64> = Context::new();
      assert!(ctx.saved_tensors().is_empty());
      ctx.save_for_backward([1.0, 2.0]);
      assert_eq!(ctx.saved_tensors(), &[1.0, 2.0]);
    }

    #[test]
    fn last_save_wins() {
      let mut ctx: Context<f64> = Context::new();
      ctx.save_for_backward([1.0]);
      ctx.save_for_backward([3.0, 4.0]);
      assert_eq!(ctx.saved_tensors(), &[3.0, 4.0]);
    }

    #[test]
    fn no_grad_drops_saves() {
      let mut ctx: Context<f64> = Context::no_grad();
      assert!(ctx.is_no_grad());
      ctx.save_for_backward([1.0, 2.0]);
      assert!(ctx.saved_tensors().is_empty());
    }
  }

  mod ids {
    use super::*;

    #[test]
    fn strictly_increasing() {
      let a = next_node_id();
      let b = next_node_id();
      let c = next_node_id();
      assert!(a < b && b < c);
    }
  }

  mod sort {
    use super::*;

    #[test]
    fn chain_root_first() {
      let x = Probe::leaf();
      let a = Probe::op(vec![(x.clone(), 2.0)]);
      let b = Probe::op(vec![(a.clone(), 3.0)]);

      let order = topological_sort(&b);
      let ids: Vec<NodeId> = order.iter().map(Variable::unique_id).collect();
      assert_eq!(ids, vec![b.unique_id(), a.unique_id(), x.unique_id()]);
    }

    #[test]
    fn diamond_visits_shared_ancestor_once() {
      let x = Probe::leaf();
      let left = Probe::op(vec![(x.clone(), 2.0)]);
      let right = Probe::op(vec![(x.clone(), 3.0)]);
      let root = Probe::op(vec![(left.clone(), 1.0), (right.clone(), 1.0)]);

      let order = topological_sort(&root);
      assert_eq!(order.len(), 4);
      assert_eq!(order[0].unique_id(), root.unique_id());
      let shared = order
        .iter()
        .filter(|v| v.unique_id() == x.unique_id())
        .count();
      assert_eq!(shared, 1);
      // x depends on everything else, so it must come last
      assert_eq!(order[3].unique_id(), x.unique_id());
    }

    #[test]
    fn prunes_constants_and_their_exclusive_ancestry() {
      let x = Probe::leaf();
      // reachable only through the constant, must never be visited
      let hidden = Probe::leaf();
      let constant = Probe::with_kind(Kind::Constant, vec![(hidden.clone(), 4.0)]);
      let root = Probe::op(vec![(x.clone(), 1.0), (constant.clone(), 1.0)]);

      let order = topological_sort(&root);
      let ids: Vec<NodeId> = order.iter().map(Variable::unique_id).collect();
      assert_eq!(ids, vec![root.unique_id(), x.unique_id()]);
      assert!(!ids.contains(&constant.unique_id()));
      assert!(!ids.contains(&hidden.unique_id()));
    }

    #[test]
    fn lone_leaf_is_its_own_order() {
      let x = Probe::leaf();
      let order = topological_sort(&x);
      assert_eq!(order.len(), 1);
      assert_eq!(order[0].unique_id(), x.unique_id());
    }

    #[test]
    fn deep_chain_does_not_overflow() {
      let mut nodes = vec![Probe::leaf()];
      for _ in 0..10_000 {
        let prev = nodes.last().unwrap().clone();
        nodes.push(Probe::op(vec![(prev, 1.0)]));
      }

      let order = topological_sort(nodes.last().unwrap());
      assert_eq!(order.len(), nodes.len());

      // release root-first so the parent chain unwinds without recursing
      drop(order);
      while nodes.pop().is_some() {}
    }
  }

  mod backprop {
    use super::*;

    #[test]
    fn diamond_sums_both_paths() {
      let x = Probe::leaf();
      let left = Probe::op(vec![(x.clone(), 2.0)]);
      let right = Probe::op(vec![(x.clone(), 3.0)]);
      let root = Probe::op(vec![(left, 1.0), (right, 1.0)]);

      backpropagate(&root, 1.0);
      // two paths, partials 2 and 3, summed not overwritten
      assert_eq!(x.accumulated(), 5.0);
      assert_eq!(x.terminal_calls(), 1);
    }

    #[test]
    fn multiple_edges_to_same_parent_sum() {
      let x = Probe::leaf();
      // one op consuming the same input twice (e.g. x * x)
      let root = Probe::op(vec![(x.clone(), 4.0), (x.clone(), 4.0)]);

      backpropagate(&root, 1.0);
      assert_eq!(x.accumulated(), 8.0);
      assert_eq!(x.terminal_calls(), 1);
    }

    #[test]
    fn leaves_get_exactly_one_terminal_call_per_pass() {
      let x = Probe::leaf();
      let y = Probe::leaf();
      let mid = Probe::op(vec![(x.clone(), 1.0), (y.clone(), 1.0)]);
      let root = Probe::op(vec![(mid.clone(), 2.0), (x.clone(), 7.0)]);

      backpropagate(&root, 1.0);
      assert_eq!(x.terminal_calls(), 1);
      assert_eq!(y.terminal_calls(), 1);
      assert_eq!(x.accumulated(), 9.0);
      assert_eq!(y.accumulated(), 2.0);
      // interior nodes never see a terminal call
      assert_eq!(mid.terminal_calls(), 0);
      assert_eq!(mid.accumulated(), 0.0);
    }

    #[test]
    fn seed_scales_linearly() {
      let x = Probe::leaf();
      let a = Probe::op(vec![(x.clone(), 2.0)]);
      let root = Probe::op(vec![(a, 3.0)]);

      backpropagate(&root, 1.0);
      let unit = x.accumulated();

      let x2 = Probe::leaf();
      let a2 = Probe::op(vec![(x2.clone(), 2.0)]);
      let root2 = Probe::op(vec![(a2, 3.0)]);

      backpropagate(&root2, 4.0);
      assert_eq!(x2.accumulated(), 4.0 * unit);
    }

    #[test]
    fn accumulates_across_passes() {
      let x = Probe::leaf();
      let root = Probe::op(vec![(x.clone(), 2.0)]);

      backpropagate(&root, 1.0);
      backpropagate(&root, 3.0);
      // s1 then s2 equals a single pass with s1 + s2
      assert_eq!(x.accumulated(), 8.0);
      assert_eq!(x.terminal_calls(), 2);
    }

    #[test]
    fn constant_branch_receives_nothing() {
      let x = Probe::leaf();
      let constant = Probe::constant();
      let root = Probe::op(vec![(x.clone(), 2.0), (constant.clone(), 5.0)]);

      backpropagate(&root, 1.0);
      assert_eq!(x.accumulated(), 2.0);
      // the chain rule emitted a contribution for the constant, but no
      // terminal call ever reaches it
      assert_eq!(constant.terminal_calls(), 0);
      assert_eq!(constant.accumulated(), 0.0);
    }

    #[test]
    fn root_leaf_takes_the_seed() {
      let x = Probe::leaf();
      backpropagate(&x, 2.5);
      assert_eq!(x.accumulated(), 2.5);
    }
  }

  mod oracle {
    use super::*;

    #[test]
    fn square() {
      let f = |vals: &[f64]| vals[0] * vals[0];
      let d = central_difference(f, &[3.0], 0, DEFAULT_EPSILON);
      assert!((d - 6.0).abs() < 1e-2);
    }

    #[test]
    fn perturbs_only_the_selected_arg() {
      let f = |vals: &[f64]| vals[0] * vals[1];
      let dx = central_difference(f, &[2.0, 3.0], 0, DEFAULT_EPSILON);
      let dy = central_difference(f, &[2.0, 3.0], 1, DEFAULT_EPSILON);
      assert!((dx - 3.0).abs() < 1e-2);
      assert!((dy - 2.0).abs() < 1e-2);
    }
  }
}
