//! Engine result values and their flattening into host tensors.

use tracing::trace;

use crate::tensor::{decode_output, NativeTensor, TensorDescriptor};
use crate::Result;

/// A possibly nested value returned by the engine.
#[derive(Debug)]
pub enum EngineValue {
    Tensor(NativeTensor),
    Sequence(Vec<EngineValue>),
    /// Map values in engine order; keys are not carried.
    Map(Vec<EngineValue>),
}

impl EngineValue {
    pub fn is_tensor(&self) -> bool {
        matches!(self, EngineValue::Tensor(_))
    }

    /// Number of direct children; zero for a tensor.
    pub fn count(&self) -> usize {
        match self {
            EngineValue::Tensor(_) => 0,
            EngineValue::Sequence(children) | EngineValue::Map(children) => children.len(),
        }
    }
}

/// Decompose `value` depth-first, left to right, appending one descriptor per
/// tensor leaf to `out`.
///
/// Uses an explicit work stack so nesting depth is bounded by the heap rather
/// than the native stack. On error, descriptors already appended stay in
/// `out`.
pub fn flatten(value: &EngineValue, out: &mut Vec<TensorDescriptor>) -> Result<()> {
    let mut stack = vec![value];

    while let Some(current) = stack.pop() {
        match current {
            EngineValue::Tensor(tensor) => {
                let size = tensor.element_count();
                let data = decode_output(tensor, size)?;
                trace!(
                    "flattened {} tensor {:?} into output {}",
                    tensor.element_type(),
                    tensor.shape(),
                    out.len()
                );
                out.push(TensorDescriptor {
                    element_type: tensor.element_type(),
                    data,
                    shape: tensor.shape().to_vec(),
                });
            }
            EngineValue::Sequence(children) | EngineValue::Map(children) => {
                stack.extend(children.iter().rev());
            }
        }
    }

    Ok(())
}
