use crate::tensor::Tensor;
use ndarray::{ArrayD, ArrayViewD, Ix2, IxDyn};
use std::collections::BTreeMap;
use std::fmt;

/// Attribute values carried by primitive operations. The engine never
/// interprets attributes; it only compares them for equality when deciding
/// whether two nodes may batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Int(i64),
    Shape(Vec<usize>),
}

/// Opaque attribute map attached to a node.
pub type Attributes = BTreeMap<String, AttrValue>;

pub fn slice_attrs(axis: usize, begin: usize, end: usize) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert("axis".to_string(), AttrValue::Int(axis as i64));
    attrs.insert("begin".to_string(), AttrValue::Int(begin as i64));
    attrs.insert("end".to_string(), AttrValue::Int(end as i64));
    attrs
}

pub fn splice_attrs(axis: usize) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert("axis".to_string(), AttrValue::Int(axis as i64));
    attrs
}

pub fn reshape_attrs(shape: &[usize]) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert("shape".to_string(), AttrValue::Shape(shape.to_vec()));
    attrs
}

fn attr_int(attrs: &Attributes, key: &str, op: OpCode) -> Result<usize, String> {
    match attrs.get(key) {
        Some(AttrValue::Int(v)) if *v >= 0 => Ok(*v as usize),
        Some(other) => Err(format!("{}: attribute '{}' has unusable value {:?}", op, key, other)),
        None => Err(format!("{}: attribute '{}' is missing", op, key)),
    }
}

/// The closed set of primitive operations the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Add,
    Sub,
    Mul,
    Div,
    Tanh,
    Sigmoid,
    Relu,
    Exp,
    /// Matrix product `W · x`; the weight is input slot 0.
    Times,
    /// Stack same-shape operands along a new last axis.
    Splice,
    /// Contiguous range of the last axis.
    Slice,
    Reshape,
    /// Sum down to the declared output shape (a scalar for user-built
    /// nodes; a widened reduce keeps its batch axis).
    ReduceSum,
    StopGradient,
    Pass,
    NoOp,
    Barrier,
}

impl OpCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpCode::Add => "add",
            OpCode::Sub => "sub",
            OpCode::Mul => "mul",
            OpCode::Div => "div",
            OpCode::Tanh => "tanh",
            OpCode::Sigmoid => "sigmoid",
            OpCode::Relu => "relu",
            OpCode::Exp => "exp",
            OpCode::Times => "times",
            OpCode::Splice => "splice",
            OpCode::Slice => "slice",
            OpCode::Reshape => "reshape",
            OpCode::ReduceSum => "reduce_sum",
            OpCode::StopGradient => "stop_gradient",
            OpCode::Pass => "pass",
            OpCode::NoOp => "no_op",
            OpCode::Barrier => "barrier",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ops that only take a view on their input. They cost nothing, are always
/// executed whole-sale ahead of regular work, and never enter the
/// batchability predicate.
pub fn is_view_op(op: OpCode) -> bool {
    matches!(
        op,
        OpCode::StopGradient
            | OpCode::Pass
            | OpCode::NoOp
            | OpCode::Barrier
            | OpCode::Reshape
            | OpCode::Slice
    )
}

fn broadcast_to<'a>(a: &'a ArrayD<f32>, dims: &[usize], op: OpCode) -> Result<ArrayViewD<'a, f32>, String> {
    a.broadcast(IxDyn(dims))
        .ok_or_else(|| format!("{}: cannot broadcast operand {:?} to {:?}", op, a.shape(), dims))
}

fn as_matrix(a: &ArrayD<f32>, rows: usize, cols: usize, op: OpCode) -> Result<ndarray::Array2<f32>, String> {
    if a.len() != rows * cols {
        return Err(format!(
            "{}: cannot view {} elements as a {}x{} panel",
            op,
            a.len(),
            rows,
            cols
        ));
    }
    let std = a.as_standard_layout();
    let (v, _) = std.into_owned().into_raw_vec_and_offset();
    ndarray::Array2::from_shape_vec((rows, cols), v).map_err(|e| format!("{}: {}", op, e))
}

/// Sum `a` down to `target` (ndarray dimension order). Used both to undo
/// broadcasting in backward passes and as the shape-driven reduce-sum
/// kernel, where the output shape says which axes survive.
fn reduce_to_shape(a: &ArrayD<f32>, target: &[usize]) -> ArrayD<f32> {
    if a.shape() == target {
        return a.clone();
    }
    let mut res = a.clone();
    // extra leading axes are summed away
    while res.ndim() > target.len() {
        res = res.sum_axis(ndarray::Axis(0));
    }
    // axes broadcast from 1 are summed back to 1
    for axis in 0..res.ndim() {
        if res.shape()[axis] != target[axis] {
            let summed = res.sum_axis(ndarray::Axis(axis));
            res = summed.insert_axis(ndarray::Axis(axis));
        }
    }
    res
}

/// Computes the forward value of a primitive op.
///
/// Costed ops write into `out` when one is supplied (the arena destination)
/// and allocate standalone storage otherwise. View ops ignore `out` and
/// return a view or alias of their input.
pub fn compute_forward(
    op: OpCode,
    attrs: &Attributes,
    inputs: &[Tensor],
    out_shape: &[usize],
    out: Option<Tensor>,
) -> Result<Tensor, String> {
    match op {
        OpCode::StopGradient | OpCode::Pass | OpCode::NoOp | OpCode::Barrier => {
            Ok(inputs[0].clone())
        }
        OpCode::Reshape => inputs[0].reshape(out_shape),
        OpCode::Slice => {
            let begin = attr_int(attrs, "begin", op)?;
            let end = attr_int(attrs, "end", op)?;
            inputs[0].slice_last_range(begin, end)
        }
        OpCode::Splice => {
            let out = match out {
                Some(t) => t,
                None => Tensor::zeros(out_shape, inputs[0].dtype()),
            };
            Tensor::gather(inputs, Some(out))
        }
        _ => {
            let result = compute_dense(op, inputs, out_shape)?;
            let out = match out {
                Some(t) => t,
                None => Tensor::zeros(out_shape, inputs[0].dtype()),
            };
            out.write_array(&result)?;
            Ok(out)
        }
    }
}

fn compute_dense(op: OpCode, inputs: &[Tensor], out_shape: &[usize]) -> Result<ArrayD<f32>, String> {
    let mut dims: Vec<usize> = out_shape.to_vec();
    dims.reverse();
    match op {
        OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div => {
            let a = inputs[0].to_array();
            let b = inputs[1].to_array();
            let av = broadcast_to(&a, &dims, op)?;
            let bv = broadcast_to(&b, &dims, op)?;
            let r = match op {
                OpCode::Add => &av + &bv,
                OpCode::Sub => &av - &bv,
                OpCode::Mul => &av * &bv,
                OpCode::Div => &av / &bv,
                _ => unreachable!(),
            };
            Ok(r)
        }
        OpCode::Tanh => Ok(inputs[0].to_array().mapv(|x| x.tanh())),
        OpCode::Sigmoid => Ok(inputs[0].to_array().mapv(|x| 1.0 / (1.0 + (-x).exp()))),
        OpCode::Relu => Ok(inputs[0].to_array().mapv(|x| x.max(0.0))),
        OpCode::Exp => Ok(inputs[0].to_array().mapv(|x| x.exp())),
        OpCode::Times => {
            let w = inputs[0].to_array(); // [in, out] in ndarray order
            let x = inputs[1].to_array(); // [..., in]
            if w.ndim() != 2 {
                return Err(format!("times: weight must have rank 2, got {:?}", inputs[0].shape()));
            }
            if x.ndim() == 0 {
                return Err("times: activation must have rank >= 1".to_string());
            }
            let in_dim = w.shape()[0];
            let out_dim = w.shape()[1];
            if x.shape()[x.ndim() - 1] != in_dim {
                return Err(format!(
                    "times: weight expects {} input features, activation has {:?}",
                    in_dim,
                    x.shape()
                ));
            }
            let m = x.len() / in_dim;
            let w2 = w
                .view()
                .into_dimensionality::<Ix2>()
                .map_err(|e| format!("times: {}", e))?;
            let x2 = as_matrix(&x, m, in_dim, op)?;
            let y = x2.dot(&w2); // [m, out]
            let mut rdims: Vec<usize> = x.shape().to_vec();
            *rdims.last_mut().expect("rank checked above") = out_dim;
            let (v, _) = y.into_raw_vec_and_offset();
            ArrayD::from_shape_vec(IxDyn(&rdims), v).map_err(|e| format!("times: {}", e))
        }
        OpCode::ReduceSum => {
            // shape-driven: a batched reduce keeps its trailing batch axis
            Ok(reduce_to_shape(&inputs[0].to_array(), &dims))
        }
        _ => Err(format!("{}: no dense kernel", op)),
    }
}

/// Back-propagates the output gradient of `op` into input `input_index`.
///
/// `beta = 0.0` means the destination gradient is uninitialized and must be
/// overwritten; `beta = 1.0` means accumulate.
#[allow(clippy::too_many_arguments)]
pub fn backprop(
    op: OpCode,
    attrs: &Attributes,
    output_value: &Tensor,
    output_gradient: &Tensor,
    inputs: &[Tensor],
    input_index: usize,
    input_gradient: &Tensor,
    beta: f32,
) -> Result<(), String> {
    let mut target: Vec<usize> = input_gradient.shape().to_vec();
    target.reverse();
    let g = output_gradient.to_array();
    match op {
        OpCode::Add => {
            let contrib = reduce_to_shape(&g, &target);
            input_gradient.accumulate(&contrib, beta)
        }
        OpCode::Sub => {
            let signed = if input_index == 0 { g } else { g.mapv(|x| -x) };
            let contrib = reduce_to_shape(&signed, &target);
            input_gradient.accumulate(&contrib, beta)
        }
        OpCode::Mul => {
            let other = inputs[1 - input_index].to_array();
            let ov = broadcast_to(&other, g.shape(), op)?;
            let contrib = reduce_to_shape(&(&g * &ov), &target);
            input_gradient.accumulate(&contrib, beta)
        }
        OpCode::Div => {
            let a = inputs[0].to_array();
            let b = inputs[1].to_array();
            let full = if input_index == 0 {
                let bv = broadcast_to(&b, g.shape(), op)?;
                &g / &bv
            } else {
                let av = broadcast_to(&a, g.shape(), op)?;
                let bv = broadcast_to(&b, g.shape(), op)?;
                -(&g * &av) / (&bv.to_owned() * &bv)
            };
            let contrib = reduce_to_shape(&full, &target);
            input_gradient.accumulate(&contrib, beta)
        }
        OpCode::Tanh => {
            let y = output_value.to_array();
            input_gradient.accumulate(&(&g * &y.mapv(|v| 1.0 - v * v)), beta)
        }
        OpCode::Sigmoid => {
            let y = output_value.to_array();
            input_gradient.accumulate(&(&g * &y.mapv(|v| v * (1.0 - v))), beta)
        }
        OpCode::Relu => {
            let x = inputs[0].to_array();
            input_gradient.accumulate(&(&g * &x.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 })), beta)
        }
        OpCode::Exp => {
            let y = output_value.to_array();
            input_gradient.accumulate(&(&g * &y), beta)
        }
        OpCode::Times => {
            let w = inputs[0].to_array(); // [in, out]
            let x = inputs[1].to_array(); // [..., in]
            let in_dim = w.shape()[0];
            let out_dim = w.shape()[1];
            let m = x.len() / in_dim;
            let g2 = as_matrix(&g, m, out_dim, op)?;
            if input_index == 0 {
                // one matrix product covers however many activations were
                // gathered under this consumer
                let x2 = as_matrix(&x, m, in_dim, op)?;
                let dw = x2.t().dot(&g2); // [in, out]
                input_gradient.accumulate(&dw.into_dyn(), beta)
            } else {
                let w2 = w
                    .view()
                    .into_dimensionality::<Ix2>()
                    .map_err(|e| format!("times: {}", e))?;
                let dx = g2.dot(&w2.t()); // [m, in]
                input_gradient.accumulate(&dx.into_dyn(), beta)
            }
        }
        OpCode::Splice => {
            let part = output_gradient.slice_last(input_index)?;
            input_gradient.accumulate(&part.to_array(), beta)
        }
        OpCode::Slice => {
            let begin = attr_int(attrs, "begin", op)?;
            let end = attr_int(attrs, "end", op)?;
            if beta == 0.0 {
                // only the sliced range receives gradient; the rest must
                // not be left uninitialized
                input_gradient.set_all(0.0);
            }
            let region = input_gradient.slice_last_range(begin, end)?;
            region.accumulate(&g, 1.0)
        }
        OpCode::Reshape | OpCode::Pass | OpCode::NoOp | OpCode::Barrier => {
            input_gradient.accumulate(&g, beta)
        }
        OpCode::ReduceSum => {
            let contrib = broadcast_to(&g, &target, op)?.to_owned();
            input_gradient.accumulate(&contrib, beta)
        }
        OpCode::StopGradient => Err("stop_gradient: backprop must never reach this op".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use ndarray::{arr1, arr2};

    fn t(a: ArrayD<f32>) -> Tensor {
        Tensor::from_array(&a)
    }

    #[test]
    fn test_add_broadcasts_unbatched_operand() {
        // batched lhs [4, 3] against a shared [4] bias
        let a = t(arr2(&[[1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0], [9.0, 10.0, 11.0, 12.0]]).into_dyn());
        let b = t(arr1(&[10.0, 20.0, 30.0, 40.0]).into_dyn());
        assert_eq!(a.shape(), &[4, 3]);
        let out = compute_forward(OpCode::Add, &Attributes::new(), &[a, b], &[4, 3], None).unwrap();
        assert_eq!(
            out.to_array(),
            arr2(&[[11.0, 22.0, 33.0, 44.0], [15.0, 26.0, 37.0, 48.0], [19.0, 30.0, 41.0, 52.0]]).into_dyn()
        );
    }

    #[test]
    fn test_times_matches_manual_product() {
        // weight [out=2, in=3] supplied as ndarray [3, 2]
        let w = t(arr2(&[[1.0, 4.0], [2.0, 5.0], [3.0, 6.0]]).into_dyn());
        let x = t(arr1(&[1.0, 1.0, 2.0]).into_dyn());
        let out = compute_forward(OpCode::Times, &Attributes::new(), &[w, x], &[2], None).unwrap();
        assert_eq!(out.to_array(), arr1(&[9.0, 21.0]).into_dyn());
    }

    #[test]
    fn test_times_batched_is_one_gemm_per_call() {
        let w = t(arr2(&[[1.0, 0.0], [0.0, 1.0]]).into_dyn()); // identity, in=out=2
        let xs = t(arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]).into_dyn()); // tensor [2, 3]
        let out = compute_forward(OpCode::Times, &Attributes::new(), &[w, xs], &[2, 3], None).unwrap();
        assert_eq!(out.shape(), &[2, 3]);
        assert_eq!(
            out.to_array(),
            arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]).into_dyn()
        );
    }

    #[test]
    fn test_slice_forward_is_a_view() {
        let x = t(arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]).into_dyn()); // [2, 3]
        let out = compute_forward(
            OpCode::Slice,
            &slice_attrs(1, 1, 3),
            &[x.clone()],
            &[2, 2],
            None,
        )
        .unwrap();
        assert_eq!(out.to_array(), arr2(&[[3.0, 4.0], [5.0, 6.0]]).into_dyn());
        // mutating the parent shows through the view
        x.set_all(0.0);
        assert!(out.to_array().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_add_backward_reduces_broadcast() {
        let a = t(arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]).into_dyn()); // [2, 3]
        let b = t(arr1(&[1.0, 1.0]).into_dyn()); // [2]
        let out = compute_forward(OpCode::Add, &Attributes::new(), &[a.clone(), b.clone()], &[2, 3], None).unwrap();
        let g = t(ArrayD::from_elem(IxDyn(&[3, 2]), 1.0));
        let gb = Tensor::zeros(&[2], DType::F32);
        backprop(OpCode::Add, &Attributes::new(), &out, &g, &[a, b], 1, &gb, 0.0).unwrap();
        assert_eq!(gb.to_array(), arr1(&[3.0, 3.0]).into_dyn());
    }

    #[test]
    fn test_times_weight_gradient() {
        // y = W x with W = identity [2x2], x = (1, 2); dL/dy = (1, 1)
        let w = t(arr2(&[[1.0, 0.0], [0.0, 1.0]]).into_dyn());
        let x = t(arr1(&[1.0, 2.0]).into_dyn());
        let y = compute_forward(OpCode::Times, &Attributes::new(), &[w.clone(), x.clone()], &[2], None).unwrap();
        let g = t(arr1(&[1.0, 1.0]).into_dyn());
        let gw = Tensor::zeros(&[2, 2], DType::F32);
        backprop(OpCode::Times, &Attributes::new(), &y, &g, &[w.clone(), x.clone()], 0, &gw, 0.0).unwrap();
        // dW = x ⊗ g, i.e. ndarray [in, out]
        assert_eq!(gw.to_array(), arr2(&[[1.0, 1.0], [2.0, 2.0]]).into_dyn());
        let gx = Tensor::zeros(&[2], DType::F32);
        backprop(OpCode::Times, &Attributes::new(), &y, &g, &[w, x], 1, &gx, 0.0).unwrap();
        assert_eq!(gx.to_array(), arr1(&[1.0, 1.0]).into_dyn());
    }

    #[test]
    fn test_slice_backward_zero_fills_fresh_gradient() {
        let x = t(arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]).into_dyn()); // [2, 3]
        let y = compute_forward(OpCode::Slice, &slice_attrs(1, 1, 2), &[x.clone()], &[2, 1], None).unwrap();
        let g = t(arr2(&[[10.0, 20.0]]).into_dyn());
        let gx = Tensor::zeros(&[2, 3], DType::F32);
        gx.set_all(f32::NAN); // fresh arena ranges are not trusted
        backprop(OpCode::Slice, &slice_attrs(1, 1, 2), &y, &g, &[x], 0, &gx, 0.0).unwrap();
        assert_eq!(
            gx.to_array(),
            arr2(&[[0.0, 0.0], [10.0, 20.0], [0.0, 0.0]]).into_dyn()
        );
    }

    #[test]
    fn test_splice_roundtrip_gradient() {
        let a = t(arr1(&[1.0, 2.0]).into_dyn());
        let b = t(arr1(&[3.0, 4.0]).into_dyn());
        let out = compute_forward(
            OpCode::Splice,
            &splice_attrs(1),
            &[a.clone(), b.clone()],
            &[2, 2],
            None,
        )
        .unwrap();
        assert_eq!(out.to_array(), arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn());
        let g = t(arr2(&[[1.0, 1.0], [2.0, 2.0]]).into_dyn());
        let gb = Tensor::zeros(&[2], DType::F32);
        backprop(OpCode::Splice, &splice_attrs(1), &out, &g, &[a, b], 1, &gb, 0.0).unwrap();
        assert_eq!(gb.to_array(), arr1(&[2.0, 2.0]).into_dyn());
    }

    #[test]
    fn test_stop_gradient_backprop_is_rejected() {
        let x = t(arr1(&[1.0]).into_dyn());
        let gx = Tensor::zeros(&[1], DType::F32);
        let err = backprop(
            OpCode::StopGradient,
            &Attributes::new(),
            &x,
            &x,
            &[x.clone()],
            0,
            &gx,
            0.0,
        )
        .unwrap_err();
        assert!(err.contains("stop_gradient"));
    }
}
