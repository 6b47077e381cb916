use half::{bf16, f16};
use ndarray::ArrayD;
use std::fmt;

/// Supported storage dtypes. Computation runs in f32; `DType` tracks the
/// intended storage semantics so conversion and serialization paths can be
/// added without touching the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
    BF16,
}

impl DType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
        }
    }

    pub fn parse(s: &str) -> Option<DType> {
        match s.to_lowercase().as_str() {
            "f32" | "float32" => Some(DType::F32),
            "f16" | "float16" => Some(DType::F16),
            "bf16" | "bfloat16" => Some(DType::BF16),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Round-trip an f32 array through the given dtype to emulate its precision.
pub fn emulate_precision(arr: &ArrayD<f32>, dtype: DType) -> ArrayD<f32> {
    match dtype {
        DType::F32 => arr.clone(),
        DType::F16 => arr.mapv(|x| f32::from(f16::from_f32(x))),
        DType::BF16 => arr.mapv(|x| f32::from(bf16::from_f32(x))),
    }
}
