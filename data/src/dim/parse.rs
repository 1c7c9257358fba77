use super::{Dim, Shape};
use crate::internal::*;

/// Parse a single dimension: an integer, or `?` / `-1` for an unresolved one.
pub fn parse_dim(s: &str) -> MoResult<Dim> {
    let s = s.trim();
    if s == "?" || s == "-1" {
        return Ok(Dim::Unknown);
    }
    let v: i64 = s.parse().with_context(|| format!("Parsing dimension {s:?}"))?;
    ensure!(v >= 0, "Invalid dimension {}", v);
    Ok(Dim::Val(v))
}

/// Parse a comma separated shape, optionally followed by a datum type:
/// `"1,3,224,224"`, `"1,3,?,?,f32"`.
pub fn parse_shape(s: &str) -> MoResult<(Shape, Option<DatumType>)> {
    let s = s.trim();
    if s.is_empty() {
        return Ok((tvec!(), None));
    }
    let mut tokens: Vec<&str> = s.split(',').map(|t| t.trim()).collect();
    let dt = match tokens.last().map(|t| t.parse::<DatumType>()) {
        Some(Ok(dt)) => {
            tokens.pop();
            Some(dt)
        }
        _ => None,
    };
    let shape = tokens.into_iter().map(parse_dim).collect::<MoResult<Shape>>()?;
    Ok((shape, dt))
}
