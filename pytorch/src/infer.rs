//! Output shapes of the operators the tracer records.
//!
//! Everything here works on `Dim`s: unresolved dimensions flow through
//! unchanged, resolved ones are checked.
use crate::internal::*;

/// Canonicalize a possibly negative axis against `rank`.
pub fn axis(axis: i64, rank: usize) -> MoResult<usize> {
    let canonical = if axis < 0 { axis + rank as i64 } else { axis };
    ensure!(
        (0..rank as i64).contains(&canonical),
        "Axis {} is out of range for a rank {} tensor",
        axis,
        rank
    );
    Ok(canonical as usize)
}

/// `view` / `reshape`: at most one `-1` placeholder, resolved against the
/// input volume.
pub fn reshape(input: &[Dim], target: &[i64]) -> MoResult<Shape> {
    let placeholders = target.iter().filter(|&&d| d == -1).count();
    ensure!(placeholders <= 1, "Reshape to [{}]: only one -1 is allowed", target.iter().join(","));
    if let Some(bad) = target.iter().find(|&&d| d < -1) {
        bail!("Reshape to [{}]: invalid dimension {}", target.iter().join(","), bad);
    }
    let rest: i64 = target.iter().filter(|&&d| d != -1).product();
    let placeholder = match volume(input) {
        Dim::Val(vol) if placeholders == 1 => {
            ensure!(
                rest != 0 && vol % rest == 0,
                "Reshape [{}] to [{}]: volume {} is not divisible by {}",
                input.iter().join(","),
                target.iter().join(","),
                vol,
                rest
            );
            Dim::Val(vol / rest)
        }
        Dim::Val(vol) => {
            ensure!(
                vol == rest,
                "Reshape [{}] to [{}]: volumes differ ({} vs {})",
                input.iter().join(","),
                target.iter().join(","),
                vol,
                rest
            );
            Dim::Unknown
        }
        Dim::Unknown => Dim::Unknown,
    };
    Ok(target.iter().map(|&d| if d == -1 { placeholder } else { Dim::Val(d) }).collect())
}

pub fn permute(input: &[Dim], order: &[usize]) -> MoResult<Shape> {
    ensure!(
        order.len() == input.len() && order.iter().sorted().copied().eq(0..input.len()),
        "Invalid permutation [{}] for a rank {} tensor",
        order.iter().join(","),
        input.len()
    );
    Ok(order.iter().map(|&ix| input[ix]).collect())
}

/// Split `axis` in chunks of `size`. Returns the number of chunks and the
/// shape of each.
pub fn split(input: &[Dim], size: i64, axis: usize) -> MoResult<(usize, Shape)> {
    ensure!(size > 0, "Split size must be positive, got {}", size);
    let dim = input[axis]
        .to_i64()
        .with_context(|| format!("Splitting an unresolved axis {axis}"))?;
    ensure!(dim % size == 0, "Can not split axis {} of size {} in chunks of {}", axis, dim, size);
    let mut shape: Shape = input.into();
    shape[axis] = Dim::Val(size);
    Ok(((dim / size) as usize, shape))
}

pub fn concat(inputs: &[impl AsRef<[Dim]>], axis: i64) -> MoResult<Shape> {
    let Some(first) = inputs.first() else { bail!("Concat of no tensor") };
    let rank = first.as_ref().len();
    let axis = self::axis(axis, rank)?;
    let mut shape: Shape = first.as_ref().into();
    for other in &inputs[1..] {
        let other = other.as_ref();
        ensure!(other.len() == rank, "Concat of tensors of different ranks");
        for (ix, d) in other.iter().enumerate() {
            if ix == axis {
                shape[ix] = shape[ix] + *d;
            } else if let (Dim::Val(a), Dim::Val(b)) = (shape[ix], *d) {
                ensure!(a == b, "Concat on axis {}: mismatched dimension {} ({} vs {})", axis, ix, a, b);
            } else {
                shape[ix] = shape[ix].broadcast(*d).unwrap_or(Dim::Unknown);
            }
        }
    }
    Ok(shape)
}

pub fn stack(inputs: &[impl AsRef<[Dim]>], axis: i64) -> MoResult<Shape> {
    let Some(first) = inputs.first() else { bail!("Stack of no tensor") };
    let first = first.as_ref();
    for other in &inputs[1..] {
        let other = other.as_ref();
        ensure!(
            other.len() == first.len()
                && other.iter().zip(first.iter()).all(|(a, b)| !a.is_known() || !b.is_known() || a == b),
            "Stack of tensors of different shapes"
        );
    }
    let axis = self::axis(axis, first.len() + 1)?;
    let mut shape: Shape = first.into();
    shape.insert(axis, Dim::Val(inputs.len() as i64));
    Ok(shape)
}

/// Spatial output size of a convolution or pooling window.
pub fn window_output_dim(
    input: Dim,
    kernel: i64,
    stride: i64,
    padding: i64,
    dilation: i64,
    ceil_mode: bool,
) -> MoResult<Dim> {
    ensure!(
        kernel > 0 && stride > 0 && dilation > 0 && padding >= 0,
        "Invalid window: kernel {}, stride {}, padding {}, dilation {}",
        kernel,
        stride,
        padding,
        dilation
    );
    let span = input + 2 * padding - dilation * (kernel - 1) - 1;
    let out = if ceil_mode {
        let out = span.div_ceil(stride) + 1;
        // the last window must start inside the input or its left padding
        match (out, input) {
            (Dim::Val(o), Dim::Val(i)) if (o - 1) * stride >= i + padding => Dim::Val(o - 1),
            _ => out,
        }
    } else {
        span.div_floor(stride) + 1
    };
    if let Dim::Val(o) = out {
        ensure!(
            o >= 1,
            TraceError::integrity(format!(
                "Window of {kernel} (dilation {dilation}) does not fit in {input} with padding {padding}"
            ))
        );
    }
    Ok(out)
}

/// Parameters of a sliding window over the trailing spatial axes.
#[derive(Clone, Debug, PartialEq)]
pub struct Window {
    pub kernel: TVec<i64>,
    pub stride: TVec<i64>,
    pub padding: TVec<i64>,
    pub dilation: TVec<i64>,
    pub ceil_mode: bool,
}

impl Window {
    pub fn spatial(&self, input: &[Dim]) -> MoResult<Shape> {
        let rank = self.kernel.len();
        ensure!(
            input.len() >= rank
                && self.stride.len() == rank
                && self.padding.len() == rank
                && self.dilation.len() == rank,
            "Window over {} axes does not match input [{}]",
            rank,
            input.iter().join(",")
        );
        let spatial = &input[input.len() - rank..];
        (0..rank)
            .map(|ix| {
                window_output_dim(
                    spatial[ix],
                    self.kernel[ix],
                    self.stride[ix],
                    self.padding[ix],
                    self.dilation[ix],
                    self.ceil_mode,
                )
                .with_context(|| format!("Spatial axis {ix}"))
            })
            .collect()
    }

    /// Pooling keeps the leading axes.
    pub fn pool(&self, input: &[Dim]) -> MoResult<Shape> {
        let spatial = self.spatial(input)?;
        Ok(input[..input.len() - spatial.len()].iter().copied().chain(spatial).collect())
    }

    /// Convolution of a `[N, C, ...]` input into `out_channels` channels.
    pub fn conv(&self, input: &[Dim], out_channels: usize) -> MoResult<Shape> {
        ensure!(
            input.len() == self.kernel.len() + 2,
            "Convolution with a {}D kernel over input [{}]",
            self.kernel.len(),
            input.iter().join(",")
        );
        let spatial = self.spatial(input)?;
        Ok([input[0], out_channels.to_dim()].into_iter().chain(spatial).collect())
    }
}

pub fn matmul(a: &[Dim], b: &[Dim]) -> MoResult<Shape> {
    ensure!(!a.is_empty() && !b.is_empty(), "MatMul of scalars");
    let a_vector = a.len() == 1;
    let b_vector = b.len() == 1;
    let a: Shape = if a_vector { tvec!(Dim::Val(1), a[0]) } else { a.into() };
    let b: Shape = if b_vector { tvec!(b[0], Dim::Val(1)) } else { b.into() };
    let (m, ka) = (a[a.len() - 2], a[a.len() - 1]);
    let (kb, n) = (b[b.len() - 2], b[b.len() - 1]);
    if let (Dim::Val(x), Dim::Val(y)) = (ka, kb) {
        ensure!(x == y, "MatMul inner dimensions differ ({} vs {})", x, y);
    }
    let mut shape = multi_broadcast(&[&a[..a.len() - 2], &b[..b.len() - 2]])?;
    if !a_vector {
        shape.push(m);
    }
    if !b_vector {
        shape.push(n);
    }
    Ok(shape)
}

pub fn flatten(input: &[Dim], start: i64, end: i64) -> MoResult<Shape> {
    if input.is_empty() {
        return Ok(tvec!(Dim::Val(1)));
    }
    let start = axis(start, input.len())?;
    let end = axis(end, input.len())?;
    ensure!(start <= end, "Flatten: start axis {} is after end axis {}", start, end);
    Ok(input[..start]
        .iter()
        .copied()
        .chain(std::iter::once(volume(&input[start..=end])))
        .chain(input[end + 1..].iter().copied())
        .collect())
}

pub fn unsqueeze(input: &[Dim], dim: i64) -> MoResult<Shape> {
    let dim = axis(dim, input.len() + 1)?;
    let mut shape: Shape = input.into();
    shape.insert(dim, Dim::Val(1));
    Ok(shape)
}

/// IR `Gather`: `data[:axis] + indices + data[axis+1:]`.
pub fn gather(data: &[Dim], indices: &[Dim], axis: usize) -> MoResult<Shape> {
    ensure!(axis < data.len(), "Gather on axis {} of a rank {} tensor", axis, data.len());
    Ok(data[..axis]
        .iter()
        .chain(indices.iter())
        .chain(data[axis + 1..].iter())
        .copied()
        .collect())
}

pub fn topk(input: &[Dim], k: i64, axis: usize) -> MoResult<Shape> {
    ensure!(axis < input.len(), "TopK on axis {} of a rank {} tensor", axis, input.len());
    ensure!(k > 0, "TopK: k={} must be positive", k);
    if let Dim::Val(d) = input[axis] {
        ensure!(k <= d, "TopK: k={} exceeds dimension {} of size {}", k, axis, d);
    }
    let mut shape: Shape = input.into();
    shape[axis] = Dim::Val(k);
    Ok(shape)
}

/// Spatial resize, from an explicit size or scale factors.
pub fn interpolate(input: &[Dim], size: Option<&[i64]>, scale: Option<&[f64]>) -> MoResult<Shape> {
    ensure!(input.len() > 2, "Interpolate needs a [N, C, ...] input");
    let spatial = input.len() - 2;
    let mut shape: Shape = input.into();
    match (size, scale) {
        (Some(size), _) => {
            let size = if size.len() == 1 { vec![size[0]; spatial] } else { size.to_vec() };
            ensure!(size.len() == spatial, "Interpolate: {} sizes for {} axes", size.len(), spatial);
            for (ix, s) in size.into_iter().enumerate() {
                shape[2 + ix] = Dim::Val(s);
            }
        }
        (None, Some(scale)) => {
            let scale = if scale.len() == 1 { vec![scale[0]; spatial] } else { scale.to_vec() };
            ensure!(scale.len() == spatial, "Interpolate: {} scales for {} axes", scale.len(), spatial);
            for (ix, s) in scale.into_iter().enumerate() {
                shape[2 + ix] = match shape[2 + ix] {
                    Dim::Val(d) => Dim::Val((d as f64 * s).floor() as i64),
                    Dim::Unknown => Dim::Unknown,
                };
            }
        }
        (None, None) => bail!("Interpolate needs a size or a scale factor"),
    }
    Ok(shape)
}

/// Adaptive pooling: trailing axes take the requested size.
pub fn adaptive_pool(input: &[Dim], output_size: &[i64]) -> MoResult<Shape> {
    ensure!(
        input.len() >= output_size.len(),
        "Adaptive pooling to {} axes of input [{}]",
        output_size.len(),
        input.iter().join(",")
    );
    let lead = input.len() - output_size.len();
    Ok(input[..lead].iter().copied().chain(output_size.iter().map(|&s| Dim::Val(s))).collect())
}

/// `x @ weight.T`: the last axis goes from `in_features` to `out_features`.
pub fn linear(input: &[Dim], in_features: usize, out_features: usize) -> MoResult<Shape> {
    let Some(&last) = input.last() else { bail!("Linear on a scalar") };
    if let Dim::Val(d) = last {
        ensure!(d == in_features as i64, "Linear expects {} features, got {}", in_features, d);
    }
    let mut shape: Shape = input.into();
    shape[input.len() - 1] = out_features.to_dim();
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
    fn reshape_placeholder() {
        assert_eq!(reshape(&s(&[2, 3, 4]), &[-1, 4]).unwrap(), s(&[6, 4]));
        assert_eq!(reshape(&s(&[2, 3, 4]), &[24]).unwrap(), s(&[24]));
        assert!(reshape(&s(&[2, 3, 4]), &[-1, 5]).is_err());
        assert!(reshape(&s(&[2, 3, 4]), &[-1, -1]).is_err());
        assert!(reshape(&s(&[2, 3, 4]), &[25]).is_err());
    }

    #[test]
    fn reshape_unknown() {
        let input = tvec!(Dim::Unknown, Dim::Val(4));
        assert_eq!(reshape(&input, &[-1, 2]).unwrap(), tvec!(Dim::Unknown, Dim::Val(2)));
    }

    #[test]
    fn conv_output() {
        let w = Window {
            kernel: tvec!(3, 3),
            stride: tvec!(1, 1),
            padding: tvec!(1, 1),
            dilation: tvec!(1, 1),
            ceil_mode: false,
        };
        assert_eq!(w.conv(&s(&[1, 3, 224, 224]), 64).unwrap(), s(&[1, 64, 224, 224]));
        let w = Window { stride: tvec!(2, 2), padding: tvec!(0, 0), ..w };
        assert_eq!(w.conv(&s(&[1, 3, 224, 224]), 8).unwrap(), s(&[1, 8, 111, 111]));
    }

    #[test]
    fn degenerate_windows() {
        let w = Window {
            kernel: tvec!(2, 2),
            stride: tvec!(0, 0),
            padding: tvec!(0, 0),
            dilation: tvec!(1, 1),
            ceil_mode: false,
        };
        assert!(w.pool(&s(&[1, 3, 8, 8])).is_err());
        let w = Window { stride: tvec!(1, 1), dilation: tvec!(0, 0), ..w };
        assert!(w.pool(&s(&[1, 3, 8, 8])).is_err());
        let w = Window { kernel: tvec!(5, 5), dilation: tvec!(1, 1), ..w };
        let err = w.conv(&s(&[1, 3, 3, 3]), 4).unwrap_err();
        assert!(matches!(err.downcast_ref::<TraceError>(), Some(TraceError::Integrity(_))));
        let w = Window { padding: tvec!(1, 1), ..w };
        assert_eq!(w.conv(&s(&[1, 3, 3, 3]), 4).unwrap(), s(&[1, 4, 1, 1]));
        let input = tvec!(Dim::Val(1), Dim::Val(3), Dim::Unknown, Dim::Val(3));
        assert_eq!(w.conv(&input, 4).unwrap()[2], Dim::Unknown);
    }

    #[test]
    fn pool_ceil_mode() {
        let w = Window {
            kernel: tvec!(2, 2),
            stride: tvec!(2, 2),
            padding: tvec!(0, 0),
            dilation: tvec!(1, 1),
            ceil_mode: true,
        };
        assert_eq!(w.pool(&s(&[1, 8, 5, 5])).unwrap(), s(&[1, 8, 3, 3]));
        let w = Window { ceil_mode: false, ..w };
        assert_eq!(w.pool(&s(&[1, 8, 5, 5])).unwrap(), s(&[1, 8, 2, 2]));
    }

    #[test]
    fn matmul_shapes() {
        assert_eq!(matmul(&s(&[2, 3]), &s(&[3, 4])).unwrap(), s(&[2, 4]));
        assert_eq!(matmul(&s(&[5, 2, 3]), &s(&[3, 4])).unwrap(), s(&[5, 2, 4]));
        assert_eq!(matmul(&s(&[3]), &s(&[3, 4])).unwrap(), s(&[4]));
        assert_eq!(matmul(&s(&[2, 3]), &s(&[3])).unwrap(), s(&[2]));
        assert!(matmul(&s(&[2, 3]), &s(&[4, 4])).is_err());
    }

    #[test]
    fn concat_and_stack() {
        assert_eq!(concat(&[s(&[1, 2, 3]), s(&[1, 5, 3])], 1).unwrap(), s(&[1, 7, 3]));
        let unknown: Shape = tvec!(Dim::Val(1), Dim::Unknown);
        assert_eq!(concat(&[s(&[1, 2]), unknown.clone()], -1).unwrap(), unknown);
        assert!(concat(&[s(&[1, 2]), s(&[2, 2])], 1).is_err());
        assert_eq!(stack(&[s(&[2, 3]), s(&[2, 3]), s(&[2, 3])], 1).unwrap(), s(&[2, 3, 3]));
        assert_eq!(stack(&[s(&[2, 3])], -1).unwrap(), s(&[2, 3, 1]));
    }

    #[test]
    fn flatten_and_unsqueeze() {
        assert_eq!(flatten(&s(&[2, 3, 4, 5]), 1, -1).unwrap(), s(&[2, 60]));
        assert_eq!(flatten(&s(&[2, 3, 4, 5]), 0, -2).unwrap(), s(&[24, 5]));
        assert_eq!(unsqueeze(&s(&[2, 3]), 0).unwrap(), s(&[1, 2, 3]));
        assert_eq!(unsqueeze(&s(&[2, 3]), -1).unwrap(), s(&[2, 3, 1]));
    }

    #[test]
    fn gather_and_topk() {
        assert_eq!(gather(&s(&[1, 1, 100, 7]), &s(&[10]), 2).unwrap(), s(&[1, 1, 10, 7]));
        assert_eq!(topk(&s(&[100]), 10, 0).unwrap(), s(&[10]));
        assert!(topk(&s(&[5]), 10, 0).is_err());
        assert_eq!(topk(&s(&[5]), 5, 0).unwrap(), s(&[5]));
        assert!(topk(&s(&[5]), 0, 0).is_err());
        assert!(topk(&s(&[5]), -1, 0).is_err());
        assert_eq!(topk(&tvec!(Dim::Unknown), 3, 0).unwrap(), s(&[3]));
    }

    #[test]
    fn interpolate_shapes() {
        let input = s(&[1, 3, 10, 20]);
        assert_eq!(interpolate(&input, Some(&[5, 5]), None).unwrap(), s(&[1, 3, 5, 5]));
        assert_eq!(interpolate(&input, None, Some(&[2.0])).unwrap(), s(&[1, 3, 20, 40]));
        assert!(interpolate(&input, None, None).is_err());
    }

    proptest! {
        #[test]
        fn reshape_resolves_placeholder(dims in proptest::collection::vec(1i64..5, 1..5), at in 0usize..5) {
            let input = s(&dims);
            let at = at % dims.len();
            let mut target = dims.clone();
            target[at] = -1;
            prop_assert_eq!(reshape(&input, &target).unwrap(), input);
        }

        #[test]
        fn split_covers_axis(chunk in 1i64..5, chunks in 1i64..5, other in 1i64..4) {
            let input = s(&[other, chunk * chunks]);
            let (n, shape) = split(&input, chunk, 1).unwrap();
            prop_assert_eq!(n as i64, chunks);
            prop_assert_eq!(shape, s(&[other, chunk]));
        }

        #[test]
        fn split_rejects_remainders(chunk in 2i64..5, chunks in 1i64..5) {
            let input = s(&[chunk * chunks + 1]);
            prop_assert!(split(&input, chunk, 0).is_err());
        }
    }
}
