//! Tensor indexing keys, and their lowering to a strided slice.
use crate::internal::*;
use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

/// One item of an indexing key: `x[0, 1.., ..3, ..]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Idx {
    Index(i64),
    Slice { start: Option<i64>, end: Option<i64>, step: i64 },
    NewAxis,
}

impl Idx {
    pub fn with_step(self, step: i64) -> Idx {
        match self {
            Idx::Slice { start, end, .. } => Idx::Slice { start, end, step },
            other => other,
        }
    }
}

/// Build an indexing key: `idx![.., 0, 3..]`.
#[macro_export]
macro_rules! idx {
    ($($e:expr),* $(,)?) => {
        [$($crate::index::Idx::from($e)),*]
    };
}

macro_rules! idx_from_int {
    ($($t:ty),*) => { $(
        impl From<$t> for Idx {
            fn from(it: $t) -> Idx {
                Idx::Index(it as i64)
            }
        }

        impl From<Range<$t>> for Idx {
            fn from(it: Range<$t>) -> Idx {
                Idx::Slice { start: Some(it.start as i64), end: Some(it.end as i64), step: 1 }
            }
        }

        impl From<RangeFrom<$t>> for Idx {
            fn from(it: RangeFrom<$t>) -> Idx {
                Idx::Slice { start: Some(it.start as i64), end: None, step: 1 }
            }
        }

        impl From<RangeTo<$t>> for Idx {
            fn from(it: RangeTo<$t>) -> Idx {
                Idx::Slice { start: None, end: Some(it.end as i64), step: 1 }
            }
        }
    )* }
}

idx_from_int!(i32, i64, usize);

impl From<RangeFull> for Idx {
    fn from(_: RangeFull) -> Idx {
        Idx::Slice { start: None, end: None, step: 1 }
    }
}

/// A key lowered to IR strided-slice operands.
///
/// `begin` and `end` have one entry per key item; axes past the key are left
/// whole. A mask entry of 1 means the matching `begin` / `end` value is used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StridedSlice {
    pub begin: TVec<i64>,
    pub end: TVec<i64>,
    pub begin_mask: TVec<i64>,
    pub end_mask: TVec<i64>,
    pub shrink_axis_mask: TVec<i64>,
    pub output_shape: Shape,
}

fn canonical(ix: i64, dim: i64) -> i64 {
    if ix < 0 { ix + dim } else { ix }
}

impl StridedSlice {
    pub fn compute(input: &[Dim], key: &[Idx]) -> MoResult<StridedSlice> {
        ensure!(
            key.len() <= input.len(),
            "Too many indices ({}) for a rank {} tensor",
            key.len(),
            input.len()
        );
        let mut slice = StridedSlice {
            begin: tvec!(),
            end: tvec!(),
            begin_mask: tvec!(),
            end_mask: tvec!(),
            shrink_axis_mask: tvec!(),
            output_shape: tvec!(),
        };
        for (axis, (item, dim)) in key.iter().zip(input.iter()).enumerate() {
            match *item {
                Idx::Index(ix) => {
                    if let Dim::Val(d) = dim {
                        let c = canonical(ix, *d);
                        ensure!(
                            (0..*d).contains(&c),
                            "Index {} is out of range for axis {} of size {}",
                            ix,
                            axis,
                            d
                        );
                        slice.push(c, c + 1, 1, 1, 1);
                    } else if ix == -1 {
                        slice.push(-1, 0, 1, 0, 1);
                    } else {
                        slice.push(ix, ix + 1, 1, 1, 1);
                    }
                }
                Idx::Slice { step, .. } if step != 1 => {
                    bail!(TraceError::unsupported(format!("slice with step {step}")))
                }
                Idx::Slice { start, end, .. } => {
                    let out = match (dim, start, end) {
                        (Dim::Val(d), _, _) => {
                            // out of range bounds are clamped to the axis
                            let b = start.map(|s| canonical(s, *d).clamp(0, *d)).unwrap_or(0);
                            let e = end.map(|e| canonical(e, *d).clamp(0, *d)).unwrap_or(*d);
                            ensure!(
                                b <= e,
                                "Empty slice {}..{} on axis {} of size {}",
                                b,
                                e,
                                axis,
                                d
                            );
                            Dim::Val(e - b)
                        }
                        (Dim::Unknown, Some(b), Some(e)) if (b < 0) == (e < 0) && b <= e => {
                            Dim::Val(e - b)
                        }
                        (Dim::Unknown, None, Some(e)) if e >= 0 => Dim::Val(e),
                        _ => Dim::Unknown,
                    };
                    slice.push(
                        start.unwrap_or(0),
                        end.unwrap_or(0),
                        start.is_some() as i64,
                        end.is_some() as i64,
                        0,
                    );
                    slice.output_shape.push(out);
                }
                Idx::NewAxis => bail!(TraceError::unsupported("indexing with a new axis")),
            }
        }
        slice.output_shape.extend(input[key.len()..].iter().copied());
        Ok(slice)
    }

    fn push(&mut self, begin: i64, end: i64, begin_mask: i64, end_mask: i64, shrink: i64) {
        self.begin.push(begin);
        self.end.push(end);
        self.begin_mask.push(begin_mask);
        self.end_mask.push(end_mask);
        self.shrink_axis_mask.push(shrink);
    }
}
