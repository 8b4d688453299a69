//!
//! # minigrad-scalar
//!
//! The f64 collaborator for the autodiff engine: the numeric primitive set
//! with its derivative rules, and a concrete [`Scalar`] graph node
//! implementing the [`Variable`] contract.
//!
//! Building an expression out of [`Scalar`] values records the computation
//! graph; calling [`Scalar::backward`] on the result deposits `d result / d
//! leaf` into every leaf's accumulator.
//!

use std::cell::Cell;
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::rc::Rc;

use lib_minigrad_core::{backpropagate, next_node_id, Context, NodeId, Variable};

use smallvec::{smallvec, SmallVec};

pub mod ops {
  //! Scalar primitives and their closed-form derivative rules.
  //!
  //! The `*_back` functions take the saved forward input and the upstream
  //! derivative, and return the downstream contribution.

  /// Offset added inside [`log`] to keep the argument away from zero.
  pub const EPS: f64 = 1e-6;

  pub fn mul(x: f64, y: f64) -> f64 {
    x * y
  }

  pub fn id(x: f64) -> f64 {
    x
  }

  pub fn add(x: f64, y: f64) -> f64 {
    x + y
  }

  pub fn neg(x: f64) -> f64 {
    -x
  }

  pub fn lt(x: f64, y: f64) -> f64 {
    if x < y {
      1.0
    } else {
      0.0
    }
  }

  pub fn eq(x: f64, y: f64) -> f64 {
    if x == y {
      1.0
    } else {
      0.0
    }
  }

  pub fn max(x: f64, y: f64) -> f64 {
    if x > y {
      x
    } else {
      y
    }
  }

  pub fn is_close(x: f64, y: f64) -> bool {
    (x - y).abs() < 1e-2
  }

  /// Numerically-stable sigmoid; the two branches avoid overflowing `exp`
  /// for large-magnitude inputs.
  pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
      1.0 / (1.0 + (-x).exp())
    } else {
      x.exp() / (1.0 + x.exp())
    }
  }

  pub fn relu(x: f64) -> f64 {
    if x > 0.0 {
      x
    } else {
      0.0
    }
  }

  pub fn log(x: f64) -> f64 {
    (x + EPS).ln()
  }

  pub fn exp(x: f64) -> f64 {
    x.exp()
  }

  pub fn inv(x: f64) -> f64 {
    1.0 / x
  }

  pub fn log_back(x: f64, d: f64) -> f64 {
    d / x
  }

  pub fn inv_back(x: f64, d: f64) -> f64 {
    -d / (x * x)
  }

  pub fn relu_back(x: f64, d: f64) -> f64 {
    if x > 0.0 {
      d
    } else {
      0.0
    }
  }

  pub fn sum<I>(xs: I) -> f64
  where
    I: IntoIterator<Item = f64>,
  {
    xs.into_iter().fold(0.0, add)
  }

  pub fn prod<I>(xs: I) -> f64
  where
    I: IntoIterator<Item = f64>,
  {
    xs.into_iter().fold(1.0, mul)
  }
}

/// The primitive differentiable operations a [`Scalar`] graph is built from.
///
/// Each variant pairs a forward computation with the derivative rule applied
/// during the backward pass. `sub` and `div` are derived (`a + (-b)` and
/// `a * inv(b)`) rather than primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarFn {
  Add,
  Mul,
  Neg,
  Inv,
  Log,
  Exp,
  Sigmoid,
  Relu,
  Lt,
  Eq,
}

impl ScalarFn {
  /// Compute the forward value, saving into `ctx` exactly what
  /// [`ScalarFn::backward`] will need.
  ///
  /// `Exp` and `Sigmoid` save their own output since the derivative is
  /// cheaper to express in terms of it; comparisons save nothing.
  pub fn forward(self, ctx: &mut Context<f64>, inputs: &[f64]) -> f64 {
    match self {
      ScalarFn::Add => ops::add(inputs[0], inputs[1]),
      ScalarFn::Mul => {
        ctx.save_for_backward([inputs[0], inputs[1]]);
        ops::mul(inputs[0], inputs[1])
      }
      ScalarFn::Neg => ops::neg(inputs[0]),
      ScalarFn::Inv => {
        ctx.save_for_backward([inputs[0]]);
        ops::inv(inputs[0])
      }
      ScalarFn::Log => {
        ctx.save_for_backward([inputs[0]]);
        ops::log(inputs[0])
      }
      ScalarFn::Exp => {
        let out = ops::exp(inputs[0]);
        ctx.save_for_backward([out]);
        out
      }
      ScalarFn::Sigmoid => {
        let out = ops::sigmoid(inputs[0]);
        ctx.save_for_backward([out]);
        out
      }
      ScalarFn::Relu => {
        ctx.save_for_backward([inputs[0]]);
        ops::relu(inputs[0])
      }
      ScalarFn::Lt => ops::lt(inputs[0], inputs[1]),
      ScalarFn::Eq => ops::eq(inputs[0], inputs[1]),
    }
  }

  /// Local derivative per input, given the values saved during the forward
  /// pass and the upstream derivative.
  ///
  /// Comparisons are step functions; their derivative is zero on both
  /// branches.
  pub fn backward(self, ctx: &Context<f64>, d_output: f64) -> SmallVec<[f64; 2]> {
    let saved = ctx.saved_tensors();
    match self {
      ScalarFn::Add => smallvec![d_output, d_output],
      ScalarFn::Mul => smallvec![saved[1] * d_output, saved[0] * d_output],
      ScalarFn::Neg => smallvec![ops::neg(d_output)],
      ScalarFn::Inv => smallvec![ops::inv_back(saved[0], d_output)],
      ScalarFn::Log => smallvec![ops::log_back(saved[0], d_output)],
      ScalarFn::Exp => smallvec![saved[0] * d_output],
      ScalarFn::Sigmoid => {
        let sigma = saved[0];
        smallvec![sigma * (1.0 - sigma) * d_output]
      }
      ScalarFn::Relu => smallvec![ops::relu_back(saved[0], d_output)],
      ScalarFn::Lt | ScalarFn::Eq => smallvec![0.0, 0.0],
    }
  }
}

enum Origin {
  /// Excluded from differentiation entirely; never visited, never receives
  /// gradient.
  Constant,
  /// An original input; gradients terminate and accumulate here.
  Leaf,
  /// Produced by a primitive operation.
  Computed(History),
}

/// The record an operation leaves behind: which primitive ran, what it
/// saved, and the handles of its inputs (the graph edges).
struct History {
  fun: ScalarFn,
  ctx: Context<f64>,
  inputs: SmallVec<[Scalar; 2]>,
}

struct Inner {
  id: NodeId,
  value: f64,
  derivative: Cell<f64>,
  origin: Origin,
}

/// A node in a scalar computation graph.
///
/// `Scalar` is a cheap-to-clone handle; clones share the same node. Leaves
/// are created with [`Scalar::new`], constants with [`Scalar::constant`],
/// everything else by applying operations.
#[derive(Clone)]
pub struct Scalar {
  inner: Rc<Inner>,
}

impl Scalar {
  /// A leaf input; [`Scalar::backward`] on any downstream result accumulates
  /// into its derivative.
  pub fn new(value: f64) -> Self {
    Self::with_origin(value, Origin::Leaf)
  }

  /// A constant, excluded from differentiation.
  pub fn constant(value: f64) -> Self {
    Self::with_origin(value, Origin::Constant)
  }

  fn with_origin(value: f64, origin: Origin) -> Self {
    Scalar {
      inner: Rc::new(Inner {
        id: next_node_id(),
        value,
        derivative: Cell::new(0.0),
        origin,
      }),
    }
  }

  #[inline]
  pub fn value(&self) -> f64 {
    self.inner.value
  }

  /// The accumulated derivative; 0.0 until a backward pass reaches this
  /// leaf. Accumulates across passes.
  #[inline]
  pub fn derivative(&self) -> f64 {
    self.inner.derivative.get()
  }

  /// Backpropagate `d self / d leaf` into every reachable leaf, seeded
  /// with 1.0.
  pub fn backward(&self) {
    backpropagate(self, 1.0);
  }

  /// Apply a primitive to some inputs.
  ///
  /// When every input is constant the result is constant too: the context is
  /// created with the no-grad gate set, nothing is saved, and no history is
  /// recorded.
  fn apply(fun: ScalarFn, inputs: &[&Scalar]) -> Scalar {
    let track = inputs.iter().any(|s| !s.is_constant());
    let mut ctx = if track {
      Context::new()
    } else {
      Context::no_grad()
    };

    let vals: SmallVec<[f64; 2]> = inputs.iter().map(|s| s.value()).collect();
    let value = fun.forward(&mut ctx, &vals);

    let origin = if track {
      Origin::Computed(History {
        fun,
        ctx,
        inputs: inputs.iter().map(|s| (*s).clone()).collect(),
      })
    } else {
      Origin::Constant
    };
    Scalar::with_origin(value, origin)
  }

  pub fn add(&self, other: &Scalar) -> Scalar {
    Scalar::apply(ScalarFn::Add, &[self, other])
  }

  pub fn mul(&self, other: &Scalar) -> Scalar {
    Scalar::apply(ScalarFn::Mul, &[self, other])
  }

  pub fn sub(&self, other: &Scalar) -> Scalar {
    self.add(&other.neg())
  }

  pub fn div(&self, other: &Scalar) -> Scalar {
    self.mul(&other.inv())
  }

  pub fn neg(&self) -> Scalar {
    Scalar::apply(ScalarFn::Neg, &[self])
  }

  pub fn inv(&self) -> Scalar {
    Scalar::apply(ScalarFn::Inv, &[self])
  }

  pub fn log(&self) -> Scalar {
    Scalar::apply(ScalarFn::Log, &[self])
  }

  pub fn exp(&self) -> Scalar {
    Scalar::apply(ScalarFn::Exp, &[self])
  }

  pub fn sigmoid(&self) -> Scalar {
    Scalar::apply(ScalarFn::Sigmoid, &[self])
  }

  pub fn relu(&self) -> Scalar {
    Scalar::apply(ScalarFn::Relu, &[self])
  }

  /// 1.0 if `self < other` else 0.0; differentiates to zero on both sides.
  pub fn lt(&self, other: &Scalar) -> Scalar {
    Scalar::apply(ScalarFn::Lt, &[self, other])
  }

  /// 1.0 if `self == other` else 0.0; differentiates to zero on both sides.
  pub fn eq(&self, other: &Scalar) -> Scalar {
    Scalar::apply(ScalarFn::Eq, &[self, other])
  }
}

impl Variable for Scalar {
  type Value = f64;

  fn unique_id(&self) -> NodeId {
    self.inner.id
  }

  fn is_leaf(&self) -> bool {
    matches!(self.inner.origin, Origin::Leaf)
  }

  fn is_constant(&self) -> bool {
    matches!(self.inner.origin, Origin::Constant)
  }

  fn parents(&self) -> SmallVec<[Scalar; 2]> {
    match &self.inner.origin {
      Origin::Computed(history) => history.inputs.clone(),
      _ => SmallVec::new(),
    }
  }

  fn chain_rule(&self, d_output: &f64) -> SmallVec<[(Scalar, f64); 2]> {
    let history = match &self.inner.origin {
      Origin::Computed(history) => history,
      _ => return SmallVec::new(),
    };
    let grads = history.fun.backward(&history.ctx, *d_output);
    history
      .inputs
      .iter()
      .zip(grads)
      .filter(|(parent, _)| !parent.is_constant())
      .map(|(parent, grad)| (parent.clone(), grad))
      .collect()
  }

  fn accumulate_derivative(&self, d: f64) {
    assert!(
      self.is_leaf(),
      "accumulate_derivative is only defined for leaves"
    );
    self.inner.derivative.set(self.inner.derivative.get() + d);
  }
}

impl fmt::Debug for Scalar {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Scalar")
      .field("value", &self.inner.value)
      .field("id", &self.inner.id)
      .finish()
  }
}

/// Float operands are lifted to constants: a literal never receives
/// gradient. Wrap it in `Scalar::new` first if it should.
macro_rules! binary_operator {
  ($op_trait:ident, $method:ident) => {
    impl $op_trait for &Scalar {
      type Output = Scalar;

      #[inline]
      fn $method(self, other: Self) -> Scalar {
        Scalar::$method(self, other)
      }
    }

    impl $op_trait for Scalar {
      type Output = Scalar;

      #[inline]
      fn $method(self, other: Self) -> Scalar {
        Scalar::$method(&self, &other)
      }
    }

    impl $op_trait<&Scalar> for Scalar {
      type Output = Scalar;

      #[inline]
      fn $method(self, other: &Scalar) -> Scalar {
        Scalar::$method(&self, other)
      }
    }

    impl $op_trait<Scalar> for &Scalar {
      type Output = Scalar;

      #[inline]
      fn $method(self, other: Scalar) -> Scalar {
        Scalar::$method(self, &other)
      }
    }

    impl $op_trait<f64> for &Scalar {
      type Output = Scalar;

      #[inline]
      fn $method(self, other: f64) -> Scalar {
        Scalar::$method(self, &Scalar::constant(other))
      }
    }

    impl $op_trait<f64> for Scalar {
      type Output = Scalar;

      #[inline]
      fn $method(self, other: f64) -> Scalar {
        Scalar::$method(&self, &Scalar::constant(other))
      }
    }
  };
}

binary_operator!(Add, add);
binary_operator!(Sub, sub);
binary_operator!(Mul, mul);
binary_operator!(Div, div);

impl Neg for &Scalar {
  type Output = Scalar;

  #[inline]
  fn neg(self) -> Scalar {
    Scalar::neg(self)
  }
}

impl Neg for Scalar {
  type Output = Scalar;

  #[inline]
  fn neg(self) -> Scalar {
    Scalar::neg(&self)
  }
}
