use crate::dtype::DType;
use crate::ops::{self, Attributes, OpCode};
use crate::tensor::Tensor;
use ndarray::ArrayD;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Role of an edge in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Parameter,
    Constant,
    Input,
    Placeholder,
    Output,
}

/// Compact list of `(consumer node, input slot)` pairs.
///
/// Most variables have exactly one consumer, so the first entry lives
/// inline and only the second consumer onwards allocates. Entries are
/// non-owning; the graph keeps nodes alive through its edges.
#[derive(Default, Debug)]
pub struct ConsumerList {
    first: Option<(Weak<Node>, usize)>,
    rest: Vec<(Weak<Node>, usize)>,
}

impl ConsumerList {
    pub fn push(&mut self, node: &Arc<Node>, slot: usize) {
        if self.first.is_none() {
            self.first = Some((Arc::downgrade(node), slot));
        } else {
            self.rest.push((Arc::downgrade(node), slot));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub fn len(&self) -> usize {
        if self.first.is_none() {
            0
        } else {
            1 + self.rest.len()
        }
    }

    pub fn clear(&mut self) {
        self.first = None;
        self.rest.clear();
    }

    /// Upgrades every entry. Fails if a consumer node has been dropped,
    /// which would mean the graph was mutated mid-evaluation.
    pub fn collect(&self) -> Result<Vec<(Arc<Node>, usize)>, String> {
        let mut out = Vec::with_capacity(self.len());
        for (weak, slot) in self.first.iter().chain(self.rest.iter()) {
            let node = weak
                .upgrade()
                .ok_or_else(|| "consumer list: consumer node was dropped during evaluation".to_string())?;
            out.push((node, *slot));
        }
        Ok(out)
    }
}

/// Mutable per-edge state shared by every handle to the same edge.
#[derive(Debug)]
pub struct VariableFields {
    pub kind: VarKind,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub needs_gradient: bool,
    /// Producing node, absent for leaves. Weak: edges do not own nodes.
    pub owner: Weak<Node>,
    pub value: Option<Tensor>,
    pub gradient: Option<Tensor>,
    /// Back-reference into a batched node: the value is logically
    /// `batched.output.slice_last(i)`, or an alias of it when the index is
    /// `None`. The strong node handle keeps the synthesized batch alive.
    pub lazy_index: Option<(Arc<Node>, Option<usize>)>,
    pub consumers: ConsumerList,
    pub visited: bool,
}

/// Idle / not-yet-visited marker for `Node::pending`.
pub(crate) const PENDING_IDLE: i32 = -1;
/// In-progress marker used to detect cycles during backward traversal.
pub(crate) const PENDING_IN_PROGRESS: i32 = -2;

static NEXT_NODE_ID: AtomicUsize = AtomicUsize::new(0);

/// A primitive operation node. Nodes own their input and output edges;
/// scheduling scratch lives in `pending`.
#[derive(Debug)]
pub struct Node {
    pub id: usize,
    pub op: OpCode,
    pub attrs: Attributes,
    pub inputs: Vec<Variable>,
    pub outputs: Vec<Variable>,
    pending: AtomicI32,
}

impl Node {
    /// Builds a node and its sole output edge. Used both by the public
    /// construction surface and by the engine for synthesized splice, slice
    /// and batched nodes.
    pub(crate) fn synthesize(
        op: OpCode,
        attrs: Attributes,
        inputs: Vec<Variable>,
        out_shape: Vec<usize>,
        dtype: DType,
        needs_gradient: bool,
    ) -> Arc<Node> {
        Arc::new_cyclic(|weak: &Weak<Node>| {
            let fields = VariableFields {
                kind: VarKind::Output,
                shape: out_shape,
                dtype,
                needs_gradient,
                owner: weak.clone(),
                value: None,
                gradient: None,
                lazy_index: None,
                consumers: ConsumerList::default(),
                visited: false,
            };
            Node {
                id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
                op,
                attrs,
                inputs,
                outputs: vec![Variable {
                    fields: Arc::new(Mutex::new(fields)),
                    producer: None,
                }],
                pending: AtomicI32::new(PENDING_IDLE),
            }
        })
    }

    pub fn pending(&self) -> i32 {
        self.pending.load(Ordering::Relaxed)
    }

    pub(crate) fn set_pending(&self, v: i32) {
        self.pending.store(v, Ordering::Relaxed);
    }

    /// The node's sole output. Multi-output nodes are not supported by the
    /// engine and are rejected wherever one would be consumed.
    pub fn sole_output(&self) -> Result<&Variable, String> {
        if self.outputs.len() != 1 {
            return Err(format!(
                "node #{} ({}): expected exactly one output, found {}",
                self.id,
                self.op,
                self.outputs.len()
            ));
        }
        Ok(&self.outputs[0])
    }

    pub fn describe(&self) -> String {
        format!("node #{} ({})", self.id, self.op)
    }
}

/// An edge in the graph: a shared handle to `VariableFields`, plus an
/// optional strong reference to the producing node. The strong reference is
/// what keeps interior nodes alive — edges handed to users (and synthesized
/// inputs created by the engine) carry it, the copies stored inside a node's
/// `outputs` do not, so no reference cycle can form.
#[derive(Clone, Debug)]
pub struct Variable {
    fields: Arc<Mutex<VariableFields>>,
    producer: Option<Arc<Node>>,
}

impl Variable {
    fn leaf(kind: VarKind, value: Option<Tensor>, shape: Vec<usize>, dtype: DType, needs_gradient: bool) -> Variable {
        Variable {
            fields: Arc::new(Mutex::new(VariableFields {
                kind,
                shape,
                dtype,
                needs_gradient,
                owner: Weak::new(),
                value,
                gradient: None,
                lazy_index: None,
                consumers: ConsumerList::default(),
                visited: false,
            })),
            producer: None,
        }
    }

    /// A trainable leaf. Its value is realized immediately.
    pub fn parameter(data: &ArrayD<f32>) -> Variable {
        let t = Tensor::from_array(data);
        let shape = t.shape().to_vec();
        let dtype = t.dtype();
        Variable::leaf(VarKind::Parameter, Some(t), shape, dtype, true)
    }

    /// A fixed leaf that never receives gradient.
    pub fn constant(data: &ArrayD<f32>) -> Variable {
        let t = Tensor::from_array(data);
        let shape = t.shape().to_vec();
        let dtype = t.dtype();
        Variable::leaf(VarKind::Constant, Some(t), shape, dtype, false)
    }

    /// A fixed leaf over an existing tensor (used e.g. for sparse operands).
    pub fn constant_tensor(t: Tensor) -> Variable {
        let shape = t.shape().to_vec();
        let dtype = t.dtype();
        Variable::leaf(VarKind::Constant, Some(t), shape, dtype, false)
    }

    /// A data-dependent leaf with no value; evaluating through it fails.
    pub fn input(shape: &[usize], dtype: DType) -> Variable {
        Variable::leaf(VarKind::Input, None, shape.to_vec(), dtype, false)
    }

    pub fn placeholder(shape: &[usize], dtype: DType) -> Variable {
        Variable::leaf(VarKind::Placeholder, None, shape.to_vec(), dtype, false)
    }

    /// Applies a primitive op to the given inputs, returning the new node's
    /// output edge. This is how graphs are built.
    pub fn apply(op: OpCode, attrs: Attributes, inputs: &[Variable]) -> Result<Variable, String> {
        let (shape, dtype) = infer_shape(op, &attrs, inputs)?;
        let needs_gradient =
            op != OpCode::StopGradient && inputs.iter().any(|v| v.needs_gradient());
        let node = Node::synthesize(op, attrs, inputs.to_vec(), shape, dtype, needs_gradient);
        Ok(node.outputs[0].with_producer(node.clone()))
    }

    pub(crate) fn with_producer(&self, node: Arc<Node>) -> Variable {
        Variable {
            fields: self.fields.clone(),
            producer: Some(node),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, VariableFields> {
        match self.fields.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        self.lock().shape.clone()
    }

    pub fn dtype(&self) -> DType {
        self.lock().dtype
    }

    pub fn kind(&self) -> VarKind {
        self.lock().kind
    }

    pub fn needs_gradient(&self) -> bool {
        self.lock().needs_gradient
    }

    /// The materialized value, if any. Does not trigger evaluation.
    pub fn current_value(&self) -> Option<Tensor> {
        self.lock().value.clone()
    }

    pub fn current_gradient(&self) -> Option<Tensor> {
        self.lock().gradient.clone()
    }

    /// True if both handles share one `VariableFields` record.
    pub fn same_fields(&self, other: &Variable) -> bool {
        Arc::ptr_eq(&self.fields, &other.fields)
    }

    /// The producing node, if it is still alive.
    pub fn owner(&self) -> Option<Arc<Node>> {
        self.lock().owner.upgrade()
    }

    /// The strong node reference this edge carries, if any. This is the
    /// handle that keeps interior nodes alive.
    pub fn producer(&self) -> Option<&Arc<Node>> {
        self.producer.as_ref()
    }

    pub fn describe(&self) -> String {
        let fields = self.lock();
        match fields.kind {
            VarKind::Output => match fields.owner.upgrade() {
                Some(node) => format!("output of {}", node.describe()),
                None => "output of a dropped node".to_string(),
            },
            kind => format!("{:?} variable", kind).to_lowercase(),
        }
    }

    // ----- combinators -----

    pub fn add(&self, other: &Variable) -> Result<Variable, String> {
        Variable::apply(OpCode::Add, Attributes::new(), &[self.clone(), other.clone()])
    }

    pub fn sub(&self, other: &Variable) -> Result<Variable, String> {
        Variable::apply(OpCode::Sub, Attributes::new(), &[self.clone(), other.clone()])
    }

    pub fn mul(&self, other: &Variable) -> Result<Variable, String> {
        Variable::apply(OpCode::Mul, Attributes::new(), &[self.clone(), other.clone()])
    }

    pub fn div(&self, other: &Variable) -> Result<Variable, String> {
        Variable::apply(OpCode::Div, Attributes::new(), &[self.clone(), other.clone()])
    }

    pub fn tanh(&self) -> Result<Variable, String> {
        Variable::apply(OpCode::Tanh, Attributes::new(), &[self.clone()])
    }

    pub fn sigmoid(&self) -> Result<Variable, String> {
        Variable::apply(OpCode::Sigmoid, Attributes::new(), &[self.clone()])
    }

    pub fn relu(&self) -> Result<Variable, String> {
        Variable::apply(OpCode::Relu, Attributes::new(), &[self.clone()])
    }

    pub fn exp(&self) -> Result<Variable, String> {
        Variable::apply(OpCode::Exp, Attributes::new(), &[self.clone()])
    }

    /// Matrix product `self · x`, with `self` as the weight (slot 0).
    pub fn times(&self, x: &Variable) -> Result<Variable, String> {
        Variable::apply(OpCode::Times, Attributes::new(), &[self.clone(), x.clone()])
    }

    /// Sum over all elements to a scalar.
    pub fn sum(&self) -> Result<Variable, String> {
        Variable::apply(OpCode::ReduceSum, Attributes::new(), &[self.clone()])
    }

    pub fn reshape(&self, shape: &[usize]) -> Result<Variable, String> {
        Variable::apply(OpCode::Reshape, ops::reshape_attrs(shape), &[self.clone()])
    }

    /// View of the `[begin, end)` range of the last axis.
    pub fn slice_last_range(&self, begin: usize, end: usize) -> Result<Variable, String> {
        let rank = self.shape().len();
        if rank == 0 {
            return Err(format!("slice: {} is a scalar", self.describe()));
        }
        Variable::apply(
            OpCode::Slice,
            ops::slice_attrs(rank - 1, begin, end),
            &[self.clone()],
        )
    }

    /// View of the `i`-th entry along the last axis (extent-1 axis kept).
    pub fn slice_last(&self, i: usize) -> Result<Variable, String> {
        self.slice_last_range(i, i + 1)
    }

    pub fn stop_gradient(&self) -> Result<Variable, String> {
        Variable::apply(OpCode::StopGradient, Attributes::new(), &[self.clone()])
    }

    pub fn barrier(&self) -> Result<Variable, String> {
        Variable::apply(OpCode::Barrier, Attributes::new(), &[self.clone()])
    }

    pub fn pass_through(&self) -> Result<Variable, String> {
        Variable::apply(OpCode::Pass, Attributes::new(), &[self.clone()])
    }

    /// Stacks same-shape variables along a new last axis.
    pub fn splice(parts: &[Variable]) -> Result<Variable, String> {
        if parts.is_empty() {
            return Err("splice: no inputs".to_string());
        }
        let rank = parts[0].shape().len();
        Variable::apply(OpCode::Splice, ops::splice_attrs(rank), parts)
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.same_fields(other)
    }
}

impl Eq for Variable {}

impl Hash for Variable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.fields).hash(state);
    }
}

/// Shapes align on their leading axes (storage order puts the batch axis
/// last, so an unbatched operand broadcasts over the trailing axes).
fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Vec<usize>, String> {
    let rank = a.len().max(b.len());
    let mut out = Vec::with_capacity(rank);
    for k in 0..rank {
        let da = a.get(k).copied().unwrap_or(1);
        let db = b.get(k).copied().unwrap_or(1);
        if da == db || db == 1 {
            out.push(da);
        } else if da == 1 {
            out.push(db);
        } else {
            return Err(format!("cannot broadcast shapes {:?} and {:?}", a, b));
        }
    }
    Ok(out)
}

fn expect_arity(op: OpCode, inputs: &[Variable], arity: usize) -> Result<(), String> {
    if inputs.len() != arity {
        return Err(format!("{}: expected {} inputs, got {}", op, arity, inputs.len()));
    }
    Ok(())
}

fn infer_shape(op: OpCode, attrs: &Attributes, inputs: &[Variable]) -> Result<(Vec<usize>, DType), String> {
    if inputs.is_empty() {
        return Err(format!("{}: at least one input required", op));
    }
    let dtype = inputs[0].dtype();
    match op {
        OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div => {
            expect_arity(op, inputs, 2)?;
            let shape = broadcast_shapes(&inputs[0].shape(), &inputs[1].shape())
                .map_err(|e| format!("{}: {}", op, e))?;
            Ok((shape, dtype))
        }
        OpCode::Tanh | OpCode::Sigmoid | OpCode::Relu | OpCode::Exp => {
            expect_arity(op, inputs, 1)?;
            Ok((inputs[0].shape(), dtype))
        }
        OpCode::Times => {
            expect_arity(op, inputs, 2)?;
            let w = inputs[0].shape();
            let x = inputs[1].shape();
            if w.len() != 2 {
                return Err(format!("times: weight must have rank 2, got {:?}", w));
            }
            if x.is_empty() || x[0] != w[1] {
                return Err(format!(
                    "times: weight {:?} cannot multiply activation {:?}",
                    w, x
                ));
            }
            let mut shape = vec![w[0]];
            shape.extend_from_slice(&x[1..]);
            Ok((shape, dtype))
        }
        OpCode::Splice => {
            let first = inputs[0].shape();
            for v in inputs.iter() {
                if v.shape() != first {
                    return Err(format!(
                        "splice: mismatched input shapes {:?} vs {:?}",
                        first,
                        v.shape()
                    ));
                }
            }
            let mut shape = first;
            shape.push(inputs.len());
            Ok((shape, dtype))
        }
        OpCode::Slice => {
            expect_arity(op, inputs, 1)?;
            let shape = inputs[0].shape();
            if shape.is_empty() {
                return Err("slice: cannot slice a scalar".to_string());
            }
            let begin = match attrs.get("begin") {
                Some(crate::ops::AttrValue::Int(v)) => *v as usize,
                _ => return Err("slice: attribute 'begin' is missing".to_string()),
            };
            let end = match attrs.get("end") {
                Some(crate::ops::AttrValue::Int(v)) => *v as usize,
                _ => return Err("slice: attribute 'end' is missing".to_string()),
            };
            let last = shape[shape.len() - 1];
            if begin > end || end > last {
                return Err(format!(
                    "slice: range {}..{} out of bounds for axis of extent {}",
                    begin, end, last
                ));
            }
            let mut out = shape;
            let rank = out.len();
            out[rank - 1] = end - begin;
            Ok((out, dtype))
        }
        OpCode::Reshape => {
            expect_arity(op, inputs, 1)?;
            let target = match attrs.get("shape") {
                Some(crate::ops::AttrValue::Shape(s)) => s.clone(),
                _ => return Err("reshape: attribute 'shape' is missing".to_string()),
            };
            let from: usize = inputs[0].shape().iter().product();
            let to: usize = target.iter().product();
            if from != to {
                return Err(format!(
                    "reshape: cannot reshape {:?} to {:?}",
                    inputs[0].shape(),
                    target
                ));
            }
            Ok((target, dtype))
        }
        OpCode::ReduceSum => {
            expect_arity(op, inputs, 1)?;
            Ok((vec![], dtype))
        }
        OpCode::StopGradient | OpCode::Pass | OpCode::NoOp | OpCode::Barrier => {
            expect_arity(op, inputs, 1)?;
            Ok((inputs[0].shape(), dtype))
        }
    }
}
