use crate::arena::{ArenaAllocator, ArenaStats, ARENA_SIZE};
use crate::graph::{Node, VarKind, Variable, PENDING_IDLE, PENDING_IN_PROGRESS};
use crate::ops::{self, OpCode};
use crate::tensor::Tensor;
use std::collections::HashMap;
use std::sync::Arc;

/// Tests whether two nodes may execute as one wide operation.
///
/// For a matrix product the weight operand must be the same fields instance,
/// not merely the same shape, so that the batch shares one weight panel.
fn compatible(a: &Arc<Node>, b: &Arc<Node>) -> bool {
    if a.op != b.op {
        return false;
    }
    if a.inputs.len() != b.inputs.len() {
        return false;
    }
    for i in 0..a.inputs.len() {
        let ia = &a.inputs[i];
        let ib = &b.inputs[i];
        if a.op == OpCode::Times && i == 0 {
            if !ia.same_fields(ib) {
                return false;
            }
        } else if ia.shape() != ib.shape() {
            return false;
        }
    }
    a.attrs == b.attrs
}

/// The set of ready operations, kept in three priority classes.
///
/// View ops cost nothing and always run first; barriers are deferred to the
/// end so that regular batches grow as wide as possible in between.
#[derive(Default)]
struct ReadySchedule {
    view_ops: Vec<Arc<Node>>,
    regular_ops: Vec<Vec<Arc<Node>>>,
    barrier_ops: Vec<Arc<Node>>,
}

impl ReadySchedule {
    fn schedule(&mut self, f: Arc<Node>) {
        if f.op == OpCode::Barrier {
            self.barrier_ops.push(f);
        } else if ops::is_view_op(f.op) {
            self.view_ops.push(f);
        } else {
            // linear scan; the number of live equivalence classes stays
            // small in practice
            for builder in self.regular_ops.iter_mut() {
                if compatible(&builder[0], &f) {
                    builder.push(f);
                    return;
                }
            }
            self.regular_ops.push(vec![f]);
        }
    }

    fn notify_input_available(&mut self, f: &Arc<Node>) -> Result<(), String> {
        let pending = f.pending();
        if pending <= 0 {
            return Err(format!(
                "{}: an input became available but none were pending",
                f.describe()
            ));
        }
        f.set_pending(pending - 1);
        if pending == 1 {
            self.schedule(f.clone());
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.view_ops.is_empty() && self.regular_ops.is_empty() && self.barrier_ops.is_empty()
    }

    /// The next batch to execute: all view ops, else the widest regular
    /// builder (first found wins a tie), else all pending barriers.
    fn pop_best(&mut self) -> Vec<Arc<Node>> {
        if !self.view_ops.is_empty() {
            return std::mem::take(&mut self.view_ops);
        }
        if !self.regular_ops.is_empty() {
            let mut best = 0;
            for (i, builder) in self.regular_ops.iter().enumerate() {
                if builder.len() > self.regular_ops[best].len() {
                    best = i;
                }
            }
            return self.regular_ops.remove(best);
        }
        std::mem::take(&mut self.barrier_ops)
    }
}

/// Execution counters, exposed so callers (and tests) can observe how much
/// batching actually happened.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Wide kernels launched for a multi-node batch.
    pub batched_launches: usize,
    /// All costed kernel launches, including gathers and unbatched ops.
    pub kernel_launches: usize,
    /// Gather (splice) kernels synthesized to assemble batched inputs.
    pub gathers: usize,
    /// View ops resolved without touching the arena.
    pub free_ops: usize,
}

/// One evaluation's worth of engine state: the ready schedule, the arena all
/// transient and output tensors live in, and counters.
///
/// An engine instance is single-shot. It mutates the graph's scratch fields
/// (`pending`, `consumers`, `visited`, `lazy_index`) and assumes nothing
/// else touches them until the call returns; after an error the scratch
/// state is undefined and the instance must be discarded.
pub struct BatchEngine {
    schedule: ReadySchedule,
    arena: ArenaAllocator,
    stats: EngineStats,
}

impl BatchEngine {
    pub fn new() -> BatchEngine {
        BatchEngine::with_arena_capacity(ARENA_SIZE)
    }

    pub fn with_arena_capacity(capacity: usize) -> BatchEngine {
        BatchEngine {
            schedule: ReadySchedule::default(),
            arena: ArenaAllocator::with_capacity(capacity),
            stats: EngineStats::default(),
        }
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn arena_stats(&self) -> ArenaStats {
        self.arena.stats()
    }

    // ===== forward =====

    /// Computes the value of `v`, batching whatever became ready together.
    pub fn value(&mut self, v: &Variable) -> Result<Tensor, String> {
        if let Some(t) = v.lock().value.clone() {
            return Ok(t);
        }
        self.traverse_forward(v)?;
        while !self.schedule.is_empty() {
            let batch = self.schedule.pop_best();
            self.execute_batch(batch)?;
        }
        self.resolve_value(v)
    }

    /// Recursively prepares the tree hanging off `v`: counts pending inputs,
    /// records consumer edges and seeds the schedule with ready nodes.
    fn traverse_forward(&mut self, v: &Variable) -> Result<(), String> {
        let (kind, has_value) = {
            let fields = v.lock();
            (fields.kind, fields.value.is_some())
        };
        if has_value {
            return Err(format!(
                "forward traversal reached {} which already has a value",
                v.describe()
            ));
        }
        match kind {
            VarKind::Input | VarKind::Placeholder => {
                return Err(format!(
                    "value of {} depends on an input and is not knowable",
                    v.describe()
                ));
            }
            VarKind::Parameter | VarKind::Constant => {
                // leaves realize their value at construction
                return Err(format!("{} has no value", v.describe()));
            }
            VarKind::Output => {}
        }
        let f = v
            .owner()
            .ok_or_else(|| format!("{}: producing node was dropped", v.describe()))?;
        if f.pending() != PENDING_IDLE {
            return Ok(()); // already visited
        }
        let mut pending = 0usize;
        for (i, input) in f.inputs.iter().enumerate() {
            if input.lock().value.is_some() {
                continue;
            }
            self.traverse_forward(input)?;
            let mut fl = input.lock();
            if fl.value.is_none() {
                pending += 1;
                fl.consumers.push(&f, i);
            }
        }
        f.set_pending(pending as i32);
        if pending == 0 {
            self.schedule.schedule(f);
        }
        Ok(())
    }

    /// Returns `v`'s value, materializing it from its batched source first
    /// if it only exists as a lazy index.
    fn resolve_value(&mut self, v: &Variable) -> Result<Tensor, String> {
        if let Some(t) = v.lock().value.clone() {
            return Ok(t);
        }
        let lazy = v.lock().lazy_index.clone();
        let (parent, idx) = match lazy {
            Some(pair) => pair,
            None => {
                return Err(format!(
                    "{} has no value and no batched source",
                    v.describe()
                ))
            }
        };
        let parent_out = parent.sole_output()?.clone();
        let from = self.resolve_value(&parent_out)?;
        let t = match idx {
            None => from,
            Some(i) => from.slice_last(i)?,
        };
        v.lock().value = Some(t.clone());
        Ok(t)
    }

    /// Computes `f`'s value into the arena (or as a free view), resolving
    /// lazy inputs on the way.
    fn memoize(&mut self, f: &Arc<Node>, is_free: bool) -> Result<Tensor, String> {
        let output = f.sole_output()?.clone();
        let mut input_values = Vec::with_capacity(f.inputs.len());
        for input in f.inputs.iter() {
            input_values.push(self.resolve_value(input)?);
        }
        let (out_shape, dtype) = {
            let fl = output.lock();
            (fl.shape.clone(), fl.dtype)
        };
        let out = if is_free {
            None
        } else {
            Some(self.arena.allocate(&out_shape, dtype))
        };
        let result = ops::compute_forward(f.op, &f.attrs, &input_values, &out_shape, out)?;
        if is_free {
            self.stats.free_ops += 1;
        } else {
            self.stats.kernel_launches += 1;
        }
        log::debug!(
            "executed {} -> {:?}{}",
            f.describe(),
            out_shape,
            if is_free { " (view)" } else { "" }
        );
        output.lock().value = Some(result.clone());
        Ok(result)
    }

    fn reset_pending(f: &Arc<Node>) -> Result<(), String> {
        if f.pending() != 0 {
            return Err(format!(
                "{}: executed while {} inputs were still pending",
                f.describe(),
                f.pending()
            ));
        }
        f.set_pending(PENDING_IDLE);
        Ok(())
    }

    /// Executes one popped batch and wakes up downstream consumers.
    fn execute_batch(&mut self, batch: Vec<Arc<Node>>) -> Result<(), String> {
        let f0 = batch[0].clone();
        let op = f0.op;
        let n = batch.len();
        let sparse_times = op == OpCode::Times
            && f0.inputs.len() > 1
            && f0.inputs[1]
                .lock()
                .value
                .as_ref()
                .map_or(false, |t| t.is_sparse());
        let do_naively =
            ops::is_view_op(op) || sparse_times || op == OpCode::Splice || n == 1;
        if do_naively {
            // no batching; still the path that proves the mechanism, and
            // the only one for sparse matmul operands and lone ops
            for f in batch.iter() {
                self.memoize(f, ops::is_view_op(f.op))?;
                Self::reset_pending(f)?;
            }
        } else {
            self.execute_batched(&batch)?;
        }
        for f in batch.iter() {
            for output in f.outputs.iter() {
                let consumers = {
                    let mut fl = output.lock();
                    let c = fl.consumers.collect()?;
                    fl.consumers.clear();
                    c
                };
                for (consumer, _slot) in consumers {
                    self.schedule.notify_input_available(&consumer)?;
                }
            }
        }
        Ok(())
    }

    /// The batched path: assemble one wide input per slot, run the op once,
    /// and implant lazy back-references on the originals.
    ///
    /// This does not rewrite the user's graph; it augments it with
    /// synthesized splice/slice/batched nodes that backward can follow.
    fn execute_batched(&mut self, batch: &[Arc<Node>]) -> Result<(), String> {
        let f0 = &batch[0];
        let op = f0.op;
        let n = batch.len();
        let is_times = op == OpCode::Times;
        let num_args = f0.inputs.len();
        let i0 = if is_times { 1 } else { 0 };

        let mut max_rank = 0usize;
        for i in i0..num_args {
            max_rank = max_rank.max(f0.inputs[i].shape().len());
        }

        let mut batched_inputs: Vec<Variable> = Vec::with_capacity(num_args);
        let mut any_batched = false;
        if is_times {
            // the weight is identical across the batch by construction
            batched_inputs.push(f0.inputs[0].clone());
        }
        for i in i0..num_args {
            let first = &f0.inputs[i];
            let lazy0 = first.lock().lazy_index.clone();
            let mut all_same = true;
            let mut consecutive_from: Option<(Arc<Node>, usize)> = None;
            if let Some((parent, Some(begin))) = &lazy0 {
                consecutive_from = Some((parent.clone(), *begin));
            }
            for (j, f) in batch.iter().enumerate() {
                let input = &f.inputs[i];
                let input_lazy = input.lock().lazy_index.clone();
                if all_same {
                    all_same = input.same_fields(first)
                        || match (&lazy0, &input_lazy) {
                            (Some((a, ai)), Some((b, bi))) => Arc::ptr_eq(a, b) && ai == bi,
                            _ => false,
                        };
                }
                if let Some((parent, begin)) = &consecutive_from {
                    let still = match &input_lazy {
                        Some((p, Some(pi))) => Arc::ptr_eq(parent, p) && *pi == begin + j,
                        _ => false,
                    };
                    if !still {
                        consecutive_from = None;
                    }
                }
            }
            if all_same {
                // every node reads the same operand: broadcast it instead
                // of gathering n copies
                batched_inputs.push(first.clone());
            } else if let Some((parent, begin)) = consecutive_from {
                // the operands are consecutive entries of one batched
                // tensor: recover it with a view instead of a gather
                let parent_out = parent.sole_output()?.clone();
                if parent_out.lock().value.is_none() {
                    return Err(format!(
                        "{}: batched source value is not materialized",
                        parent.describe()
                    ));
                }
                let parent_dims = parent_out.shape();
                let axis = parent_dims.len() - 1;
                if begin == 0 && n == parent_dims[axis] {
                    batched_inputs.push(parent_out.with_producer(parent.clone()));
                } else {
                    let mut out_shape = parent_dims.clone();
                    out_shape[axis] = n;
                    let slice = Node::synthesize(
                        OpCode::Slice,
                        ops::slice_attrs(axis, begin, begin + n),
                        vec![parent_out.with_producer(parent.clone())],
                        out_shape,
                        parent_out.dtype(),
                        parent_out.needs_gradient(),
                    );
                    self.memoize(&slice, true)?;
                    batched_inputs.push(slice.sole_output()?.with_producer(slice.clone()));
                }
                any_batched = true;
            } else {
                let parts: Vec<Variable> = batch.iter().map(|f| f.inputs[i].clone()).collect();
                let v0 = self.resolve_value(&parts[0])?;
                let mut out_shape = v0.shape().to_vec();
                out_shape.resize(max_rank, 1); // pad with unit axes
                out_shape.push(n);
                let needs_gradient = parts.iter().any(|p| p.needs_gradient());
                let splice = Node::synthesize(
                    OpCode::Splice,
                    ops::splice_attrs(max_rank),
                    parts,
                    out_shape,
                    v0.dtype(),
                    needs_gradient,
                );
                self.memoize(&splice, false)?;
                self.stats.gathers += 1;
                batched_inputs.push(splice.sole_output()?.with_producer(splice.clone()));
                any_batched = true;
            }
        }

        let batched = if any_batched {
            let out0 = f0.sole_output()?;
            let mut out_shape = out0.shape();
            out_shape.resize(max_rank, 1);
            out_shape.push(n);
            let needs_gradient = batched_inputs.iter().any(|p| p.needs_gradient());
            Node::synthesize(
                op,
                f0.attrs.clone(),
                batched_inputs,
                out_shape,
                out0.dtype(),
                needs_gradient,
            )
        } else {
            // all operands broadcast: one computation stands in for all
            let out0 = f0.sole_output()?;
            let needs_gradient = f0.inputs.iter().any(|p| p.needs_gradient());
            Node::synthesize(
                op,
                f0.attrs.clone(),
                f0.inputs.clone(),
                out0.shape(),
                out0.dtype(),
                needs_gradient,
            )
        };
        self.memoize(&batched, false)?;
        self.stats.batched_launches += 1;
        log::debug!(
            "batched {} instances of {} as {}",
            n,
            op,
            batched.describe()
        );

        for (j, f) in batch.iter().enumerate() {
            let idx = if any_batched { Some(j) } else { None };
            f.sole_output()?.lock().lazy_index = Some((batched.clone(), idx));
            Self::reset_pending(f)?;
        }
        Ok(())
    }

    // ===== backward =====

    /// Lazily creates `v`'s gradient buffer. Returns the beta the next
    /// backprop into it must use: 0 when the buffer is fresh and may be
    /// overwritten, 1 when it must accumulate.
    fn ensure_gradient(&mut self, v: &Variable) -> Result<f32, String> {
        if v.lock().gradient.is_some() {
            return Ok(1.0);
        }
        let lazy = v.lock().lazy_index.clone();
        if let Some((parent, idx)) = lazy {
            // the gradient lives inside the batched parent's buffer
            let parent_out = parent.sole_output()?.clone();
            let mut beta = self.ensure_gradient(&parent_out)?;
            let parent_grad = parent_out
                .lock()
                .gradient
                .clone()
                .ok_or_else(|| format!("{}: batched gradient missing", parent.describe()))?;
            match idx {
                None => {
                    v.lock().gradient = Some(parent_grad);
                }
                Some(i) => {
                    if beta == 0.0 {
                        // slicing into the parent cannot use overwrite
                        // semantics, so clear it once up front
                        parent_grad.set_all(0.0);
                        beta = 1.0;
                    }
                    v.lock().gradient = Some(parent_grad.slice_last(i)?);
                }
            }
            Ok(beta)
        } else {
            let (shape, dtype) = {
                let fl = v.lock();
                (fl.shape.clone(), fl.dtype)
            };
            let t = self.arena.allocate(&shape, dtype);
            v.lock().gradient = Some(t);
            Ok(0.0)
        }
    }

    /// Builds the consumer map backward works off, redirecting reads of
    /// lazily indexed variables into their batched source so gradients flow
    /// through the wide ops.
    fn determine_consumers(&mut self, v: &Variable) -> Result<(), String> {
        let (kind, has_value, needs_gradient) = {
            let mut fl = v.lock();
            fl.visited = false;
            (fl.kind, fl.value.is_some(), fl.needs_gradient)
        };
        match kind {
            VarKind::Parameter | VarKind::Constant => return Ok(()),
            VarKind::Input | VarKind::Placeholder => {
                return Err(format!(
                    "backward traversal reached {} unexpectedly",
                    v.describe()
                ));
            }
            VarKind::Output => {}
        }
        if !has_value {
            return Err(format!(
                "{} has no value during backward traversal",
                v.describe()
            ));
        }
        if !needs_gradient {
            return Err(format!(
                "backward traversal reached {} which does not need a gradient",
                v.describe()
            ));
        }
        let lazy = v.lock().lazy_index.clone();
        let node = match lazy {
            Some((parent, _)) => parent,
            None => v
                .owner()
                .ok_or_else(|| format!("{}: producing node was dropped", v.describe()))?,
        };
        self.determine_consumers_node(&node)
    }

    fn determine_consumers_node(&mut self, f: &Arc<Node>) -> Result<(), String> {
        let pending = f.pending();
        if pending == PENDING_IN_PROGRESS {
            return Err(format!(
                "{}: cycle detected during backward traversal",
                f.describe()
            ));
        }
        if pending != PENDING_IDLE {
            return Ok(()); // already traversed
        }
        if f.op == OpCode::StopGradient {
            return Err(format!(
                "{}: reached during backward traversal; the branch should have been pruned",
                f.describe()
            ));
        }
        f.set_pending(PENDING_IN_PROGRESS);
        for i in 0..f.inputs.len() {
            let mut input = f.inputs[i].clone();
            let redirect = input.lock().lazy_index.clone();
            if let Some((parent, _)) = redirect {
                // gradients must flow through the batched op, not the
                // original it stands in for
                input = parent.sole_output()?.with_producer(parent.clone());
            }
            let descend = {
                let mut fl = input.lock();
                fl.visited = false;
                if !fl.needs_gradient {
                    false
                } else {
                    // gradients accumulate across consumers; start clean.
                    // User-supplied buffers are re-implanted afterwards.
                    fl.gradient = None;
                    fl.consumers.push(f, i);
                    true
                }
            };
            if descend {
                self.determine_consumers(&input)?;
            }
        }
        f.set_pending(0); // traversal-complete marker
        Ok(())
    }

    /// Pulls gradient into `v` from all of its consumers, recursively
    /// realizing the consumers' own output gradients first.
    fn aggregate_gradients(&mut self, v: &Variable) -> Result<(), String> {
        let (visited, has_consumers, needs_gradient) = {
            let fl = v.lock();
            (fl.visited, !fl.consumers.is_empty(), fl.needs_gradient)
        };
        if visited {
            return Ok(());
        }
        if !has_consumers {
            return Ok(()); // edge of the consumer map
        }
        if !needs_gradient {
            return Err(format!(
                "gradient pulled into {} which does not need one",
                v.describe()
            ));
        }
        v.lock().visited = true;
        let consumers = {
            let fl = v.lock();
            fl.consumers.collect()?
        };
        for (c, _) in consumers.iter() {
            for output in c.outputs.iter() {
                self.aggregate_gradients(output)?;
            }
        }
        let (kind, has_gradient) = {
            let fl = v.lock();
            (fl.kind, fl.gradient.is_some())
        };
        if kind != VarKind::Parameter && has_gradient {
            return Err(format!(
                "{} unexpectedly already has a gradient",
                v.describe()
            ));
        }
        if consumers.len() == 1 {
            let (c, i) = &consumers[0];
            return self.backprop_one(c, *i);
        }
        // sort consumers into buckets that can share a backprop strategy
        let mut matrix_weight: Vec<(Arc<Node>, usize)> = Vec::new();
        let mut other: Vec<(Arc<Node>, usize)> = Vec::new();
        for (c, i) in consumers.into_iter() {
            c.sole_output()?;
            if c.op == OpCode::Times && i == 0 {
                matrix_weight.push((c, i));
            } else {
                other.push((c, i));
            }
        }
        if !matrix_weight.is_empty() {
            self.backprop_to_matrix_weight(&matrix_weight)?;
        }
        for (c, i) in other.iter() {
            self.backprop_one(c, *i)?;
        }
        Ok(())
    }

    /// All consumers that multiply this weight.
    ///
    /// TODO: gather the (output gradient, activation) panels of the bucket
    /// and replace the per-consumer products below with a single wide one.
    fn backprop_to_matrix_weight(
        &mut self,
        consumers: &[(Arc<Node>, usize)],
    ) -> Result<(), String> {
        for (c, i) in consumers.iter() {
            self.backprop_one(c, *i)?;
        }
        Ok(())
    }

    /// Back-propagates all of `f`'s output gradient into input `index`.
    fn backprop_one(&mut self, f: &Arc<Node>, index: usize) -> Result<(), String> {
        let input = f.inputs[index].clone();
        if !input.needs_gradient() {
            return Err(format!(
                "{}: input {} does not need a gradient",
                f.describe(),
                index
            ));
        }
        let output = f.sole_output()?.clone();
        let (out_value, out_grad) = {
            let fl = output.lock();
            if fl.lazy_index.is_some() {
                return Err(format!(
                    "{} does not own its output; gradients flow through its batched source",
                    f.describe()
                ));
            }
            let value = fl
                .value
                .clone()
                .ok_or_else(|| format!("{}: output value missing during backprop", f.describe()))?;
            let grad = fl.gradient.clone().ok_or_else(|| {
                format!("{}: output gradient missing during backprop", f.describe())
            })?;
            (value, grad)
        };
        let mut input_values = Vec::with_capacity(f.inputs.len());
        for inp in f.inputs.iter() {
            input_values.push(inp.lock().value.clone().ok_or_else(|| {
                format!("{}: input value missing during backprop", f.describe())
            })?);
        }
        let beta = self.ensure_gradient(&input)?;
        let grad = input
            .lock()
            .gradient
            .clone()
            .ok_or_else(|| format!("{}: gradient buffer missing", f.describe()))?;
        ops::backprop(
            f.op,
            &f.attrs,
            &out_value,
            &out_grad,
            &input_values,
            index,
            &grad,
            beta,
        )
    }

    /// Computes gradients of `root` for every key of `grads`.
    ///
    /// A supplied tensor is zeroed and reused as the output buffer; `None`
    /// entries are allocated lazily. On return each entry holds the
    /// computed gradient.
    pub fn backward(
        &mut self,
        root: &Variable,
        grads: &mut HashMap<Variable, Option<Tensor>>,
    ) -> Result<(), String> {
        if !root.needs_gradient() {
            return Err(format!(
                "backward: cannot compute gradients for {} which does not need one",
                root.describe()
            ));
        }
        self.value(root)?;
        self.determine_consumers(root)?;
        // seed the root with ones
        self.ensure_gradient(root)?;
        let seed = root.lock().gradient.clone();
        match seed {
            Some(t) => t.set_all(1.0),
            None => return Err(format!("{}: root gradient missing", root.describe())),
        }
        // reuse user-provided output buffers
        for (param, buf) in grads.iter() {
            if let Some(t) = buf {
                t.set_all(0.0);
                param.lock().gradient = Some(t.clone());
            }
        }
        for param in grads.keys() {
            let (has_consumers, needs_gradient) = {
                let fl = param.lock();
                (!fl.consumers.is_empty(), fl.needs_gradient)
            };
            if !has_consumers {
                return Err(format!(
                    "backward: requested gradient for {} which is not part of the root",
                    param.describe()
                ));
            }
            if !needs_gradient {
                return Err(format!(
                    "backward: {} does not need a gradient",
                    param.describe()
                ));
            }
            self.aggregate_gradients(param)?;
        }
        for (param, buf) in grads.iter_mut() {
            *buf = param.lock().gradient.clone();
        }
        // leave the requested parameters reusable
        for param in grads.keys() {
            let mut fl = param.lock();
            fl.consumers.clear();
            fl.visited = false;
        }
        Ok(())
    }
}

impl Default for BatchEngine {
    fn default() -> Self {
        BatchEngine::new()
    }
}

impl Variable {
    /// Computes this edge's value with a fresh single-shot engine.
    pub fn batched_forward(&self) -> Result<Tensor, String> {
        BatchEngine::new().value(self)
    }

    /// Computes gradients of this edge for every key of `grads` with a
    /// fresh single-shot engine.
    pub fn batched_backward(
        &self,
        grads: &mut HashMap<Variable, Option<Tensor>>,
    ) -> Result<(), String> {
        BatchEngine::new().backward(self, grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use ndarray::arr1;

    #[test]
    fn test_schedule_prefers_views_then_widest_builder() {
        let a = Variable::parameter(&arr1(&[1.0, 2.0]).into_dyn());
        let b = Variable::parameter(&arr1(&[3.0, 4.0]).into_dyn());
        let mut sched = ReadySchedule::default();
        let add1 = a.add(&b).unwrap().owner().unwrap();
        let add2 = a.add(&b).unwrap().owner().unwrap();
        let mul1 = a.mul(&b).unwrap().owner().unwrap();
        let view = a.reshape(&[2]).unwrap().owner().unwrap();
        let barrier = a.barrier().unwrap().owner().unwrap();
        for f in [&mul1, &add1, &add2, &view, &barrier] {
            f.set_pending(0);
            sched.schedule(f.clone());
        }
        // views first
        let first = sched.pop_best();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].op, OpCode::Reshape);
        // then the widest regular builder (the two adds)
        let second = sched.pop_best();
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].op, OpCode::Add);
        let third = sched.pop_best();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].op, OpCode::Mul);
        // barriers only when nothing else is left
        let fourth = sched.pop_best();
        assert_eq!(fourth[0].op, OpCode::Barrier);
        assert!(sched.is_empty());
    }

    #[test]
    fn test_compatible_requires_same_op_shape_attrs() {
        let a = Variable::parameter(&arr1(&[1.0, 2.0]).into_dyn());
        let b = Variable::parameter(&arr1(&[3.0, 4.0]).into_dyn());
        let c = Variable::parameter(&arr1(&[1.0, 2.0, 3.0]).into_dyn());
        let add_ab = a.add(&b).unwrap().owner().unwrap();
        let add_ba = b.add(&a).unwrap().owner().unwrap();
        let add_cc = c.add(&c).unwrap().owner().unwrap();
        let mul_ab = a.mul(&b).unwrap().owner().unwrap();
        assert!(compatible(&add_ab, &add_ba));
        assert!(!compatible(&add_ab, &add_cc));
        assert!(!compatible(&add_ab, &mul_ab));
    }

    #[test]
    fn test_compatible_times_requires_shared_weight() {
        let w1 = Variable::parameter(&ndarray::Array2::<f32>::zeros((2, 2)).into_dyn());
        let w2 = Variable::parameter(&ndarray::Array2::<f32>::zeros((2, 2)).into_dyn());
        let x = Variable::constant(&arr1(&[1.0, 2.0]).into_dyn());
        let y = Variable::constant(&arr1(&[3.0, 4.0]).into_dyn());
        let t1 = w1.times(&x).unwrap().owner().unwrap();
        let t2 = w1.times(&y).unwrap().owner().unwrap();
        let t3 = w2.times(&y).unwrap().owner().unwrap();
        assert!(compatible(&t1, &t2));
        assert!(!compatible(&t1, &t3)); // same shape, different weight object
    }

    #[test]
    fn test_value_rejects_inputs() {
        let x = Variable::input(&[2], DType::F32);
        let y = x.tanh().unwrap();
        let err = BatchEngine::new().value(&y).unwrap_err();
        assert!(err.contains("not knowable"), "unexpected error: {}", err);
    }

    #[test]
    fn test_notify_underflow_is_an_error() {
        let a = Variable::parameter(&arr1(&[1.0]).into_dyn());
        let f = a.tanh().unwrap().owner().unwrap();
        f.set_pending(0);
        let mut sched = ReadySchedule::default();
        assert!(sched.notify_input_available(&f).is_err());
    }
}
