use crate::{PortSpec, TensorMap, ValidationError};

/// Checks `tensors` against each port contract. With `dynamic_batch` the
/// leading template dimension accepts any size.
pub fn validate(
    tensors: &TensorMap,
    ports: &[PortSpec],
    dynamic_batch: bool,
) -> Result<(), ValidationError> {
    for port in ports {
        let tensor = tensors.get(&port.name).ok_or_else(|| ValidationError::Missing {
            port: port.name.clone(),
        })?;

        if tensor.dtype() != port.dtype {
            return Err(ValidationError::Datatype {
                port: port.name.clone(),
                expected: port.dtype,
                got: tensor.dtype(),
            });
        }

        let dims = tensor.shape().dims();
        let skip = usize::from(dynamic_batch);
        let rank_ok = dims.len() == port.rank();
        let dims_ok = rank_ok
            && port
                .dims
                .iter()
                .zip(dims)
                .skip(skip)
                .all(|(expected, got)| expected.map_or(true, |e| e == *got));

        if !dims_ok {
            return Err(ValidationError::Shape {
                port: port.name.clone(),
                expected: format!("{:?}", port.wire_dims()),
                got: tensor.shape().clone(),
            });
        }
    }
    Ok(())
}
