use crate::internal::*;

/// Numpy broadcasting of any number of shapes.
pub fn multi_broadcast(shapes: &[impl AsRef<[Dim]>]) -> MoResult<Shape> {
    let Some(len) = shapes.iter().map(|shape| shape.as_ref().len()).max() else {
        return Ok(tvec!());
    };
    let mut shape: Shape = tvec!();
    for i in 0..len {
        let mut wanted_size = Dim::Val(1);
        for s in shapes {
            let s = s.as_ref();
            let dim = if i < s.len() { s[s.len() - i - 1] } else { Dim::Val(1) };
            wanted_size = wanted_size.broadcast(dim).with_context(|| {
                format!(
                    "Broadcasting {}",
                    shapes.iter().map(|s| format!("[{}]", s.as_ref().iter().join(","))).join(" and ")
                )
            })?;
        }
        shape.push(wanted_size)
    }
    shape.reverse();
    Ok(shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn s(dims: &[i64]) -> Shape {
        to_shape(dims)
    }

    #[test]
    fn onnx_1() {
        assert_eq!(multi_broadcast(&[s(&[2, 3, 4, 5]), s(&[])]).unwrap(), s(&[2, 3, 4, 5]))
    }

    #[test]
    fn onnx_2() {
        assert_eq!(multi_broadcast(&[s(&[2, 3, 4, 5]), s(&[5])]).unwrap(), s(&[2, 3, 4, 5]))
    }

    #[test]
    fn onnx_3() {
        assert_eq!(multi_broadcast(&[s(&[4, 5]), s(&[2, 3, 4, 5])]).unwrap(), s(&[2, 3, 4, 5]))
    }

    #[test]
    fn onnx_4() {
        assert_eq!(multi_broadcast(&[s(&[1, 4, 5]), s(&[2, 3, 4, 1])]).unwrap(), s(&[2, 3, 4, 5]))
    }

    #[test]
    fn onnx_5() {
        assert_eq!(multi_broadcast(&[s(&[3, 4, 5]), s(&[2, 1, 1, 1])]).unwrap(), s(&[2, 3, 4, 5]))
    }

    #[test]
    fn unknown() {
        let a = tvec!(Dim::Unknown, Dim::Val(3), Dim::Val(1));
        let b = s(&[1, 3, 7]);
        assert_eq!(multi_broadcast(&[a, b]).unwrap(), tvec!(Dim::Unknown, Dim::Val(3), Dim::Val(7)));
    }

    #[test]
    fn incompatible() {
        assert!(multi_broadcast(&[s(&[2, 3]), s(&[4, 3])]).is_err());
    }

    proptest! {
        #[test]
        fn broadcast_against_self_is_identity(dims in proptest::collection::vec(1i64..6, 0..5)) {
            let shape = s(&dims);
            prop_assert_eq!(multi_broadcast(&[shape.clone(), shape.clone()]).unwrap(), shape);
        }

        #[test]
        fn broadcast_against_ones(dims in proptest::collection::vec(1i64..6, 0..5), extra in 0usize..3) {
            let shape = s(&dims);
            let ones: Shape = tvec![Dim::Val(1); dims.len() + extra];
            let result = multi_broadcast(&[ones, shape.clone()]).unwrap();
            prop_assert_eq!(result.len(), dims.len() + extra);
            prop_assert_eq!(&result[extra..], &shape[..]);
        }
    }
}
