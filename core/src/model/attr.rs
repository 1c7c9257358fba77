use mo_data::internal::*;
use std::collections::BTreeMap;
use std::fmt;

/// A node or graph attribute value.
#[derive(Clone, Debug, PartialEq)]
pub enum Attr {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ints(TVec<i64>),
    Floats(TVec<f64>),
    Strs(Vec<String>),
    Shape(Shape),
    Tensor(Arc<Tensor>),
}

impl Attr {
    pub fn kind(&self) -> &'static str {
        match self {
            Attr::Bool(_) => "bool",
            Attr::Int(_) => "int",
            Attr::Float(_) => "float",
            Attr::Str(_) => "string",
            Attr::Ints(_) => "ints",
            Attr::Floats(_) => "floats",
            Attr::Strs(_) => "strings",
            Attr::Shape(_) => "shape",
            Attr::Tensor(_) => "tensor",
        }
    }
}

impl fmt::Display for Attr {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Attr::Bool(b) => write!(fmt, "{b}"),
            Attr::Int(i) => write!(fmt, "{i}"),
            Attr::Float(f) => write!(fmt, "{f}"),
            Attr::Str(s) => write!(fmt, "{s:?}"),
            Attr::Ints(v) => write!(fmt, "[{}]", v.iter().join(",")),
            Attr::Floats(v) => write!(fmt, "[{}]", v.iter().join(",")),
            Attr::Strs(v) => write!(fmt, "[{}]", v.iter().map(|s| format!("{s:?}")).join(",")),
            Attr::Shape(v) => write!(fmt, "[{}]", v.iter().join(",")),
            Attr::Tensor(t) => write!(fmt, "{t:?}"),
        }
    }
}

macro_rules! attr_from {
    ($($t:ty => |$it:ident| $e:expr),* $(,)?) => { $(
        impl From<$t> for Attr {
            fn from($it: $t) -> Attr {
                $e
            }
        }
    )* }
}

attr_from!(
    bool => |it| Attr::Bool(it),
    i64 => |it| Attr::Int(it),
    i32 => |it| Attr::Int(it as i64),
    usize => |it| Attr::Int(it as i64),
    f64 => |it| Attr::Float(it),
    f32 => |it| Attr::Float(it as f64),
    &str => |it| Attr::Str(it.to_string()),
    String => |it| Attr::Str(it),
    TVec<i64> => |it| Attr::Ints(it),
    Vec<i64> => |it| Attr::Ints(it.into()),
    &[i64] => |it| Attr::Ints(it.into()),
    &[usize] => |it| Attr::Ints(it.iter().map(|&d| d as i64).collect()),
    TVec<f64> => |it| Attr::Floats(it),
    Vec<f64> => |it| Attr::Floats(it.into()),
    Vec<String> => |it| Attr::Strs(it),
    Shape => |it| Attr::Shape(it),
    Tensor => |it| Attr::Tensor(Arc::new(it)),
    Arc<Tensor> => |it| Attr::Tensor(it),
);

impl<const N: usize> From<[i64; N]> for Attr {
    fn from(it: [i64; N]) -> Attr {
        Attr::Ints(it.into_iter().collect())
    }
}

/// An ordered, string keyed attribute dictionary.
///
/// Typed getters fail with the attribute name and the kind actually found.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Attrs(BTreeMap<String, Attr>);

impl Attrs {
    pub fn new() -> Attrs {
        Attrs::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Attr>) -> Attrs {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Attr>) -> Option<Attr> {
        self.0.insert(name.into(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<Attr> {
        self.0.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Attr> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Attr)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Merge `other` into self, `other` winning on conflicts.
    pub fn merge(&mut self, other: Attrs) {
        self.0.extend(other.0)
    }

    fn expect(&self, name: &str) -> MoResult<&Attr> {
        self.get(name).with_context(|| format!("Attribute '{name}' is required"))
    }

    fn wrong(name: &str, wanted: &str, got: &Attr) -> MoError {
        format_err!("Attribute '{}': expected {}, got {} ({})", name, wanted, got.kind(), got)
    }

    pub fn get_bool(&self, name: &str) -> MoResult<bool> {
        match self.expect(name)? {
            Attr::Bool(b) => Ok(*b),
            Attr::Int(i) => Ok(*i != 0),
            other => Err(Self::wrong(name, "bool", other)),
        }
    }

    pub fn get_int(&self, name: &str) -> MoResult<i64> {
        match self.expect(name)? {
            Attr::Int(i) => Ok(*i),
            other => Err(Self::wrong(name, "int", other)),
        }
    }

    pub fn get_usize(&self, name: &str) -> MoResult<usize> {
        let v = self.get_int(name)?;
        ensure!(v >= 0, "Attribute '{}': expected a non-negative int, got {}", name, v);
        Ok(v as usize)
    }

    pub fn get_float(&self, name: &str) -> MoResult<f64> {
        match self.expect(name)? {
            Attr::Float(f) => Ok(*f),
            Attr::Int(i) => Ok(*i as f64),
            other => Err(Self::wrong(name, "float", other)),
        }
    }

    pub fn get_str(&self, name: &str) -> MoResult<&str> {
        match self.expect(name)? {
            Attr::Str(s) => Ok(s),
            other => Err(Self::wrong(name, "string", other)),
        }
    }

    pub fn get_ints(&self, name: &str) -> MoResult<TVec<i64>> {
        match self.expect(name)? {
            Attr::Ints(v) => Ok(v.clone()),
            Attr::Int(i) => Ok(tvec!(*i)),
            Attr::Shape(s) => s.iter().map(|d| d.to_i64()).collect(),
            other => Err(Self::wrong(name, "ints", other)),
        }
    }

    /// An int-or-tuple parameter (`kernel_size=3` or `kernel_size=(3, 3)`),
    /// expanded to `rank` values.
    pub fn get_ints_for_rank(&self, name: &str, rank: usize) -> MoResult<TVec<i64>> {
        let v = self.get_ints(name)?;
        if v.len() == 1 && rank != 1 {
            Ok(tvec!(v[0]; rank))
        } else {
            ensure!(
                v.len() == rank,
                "Attribute '{}': expected {} values, got [{}]",
                name,
                rank,
                v.iter().join(",")
            );
            Ok(v)
        }
    }

    pub fn get_floats(&self, name: &str) -> MoResult<TVec<f64>> {
        match self.expect(name)? {
            Attr::Floats(v) => Ok(v.clone()),
            Attr::Float(f) => Ok(tvec!(*f)),
            Attr::Ints(v) => Ok(v.iter().map(|&i| i as f64).collect()),
            other => Err(Self::wrong(name, "floats", other)),
        }
    }

    pub fn get_shape(&self, name: &str) -> MoResult<Shape> {
        match self.expect(name)? {
            Attr::Shape(s) => Ok(s.clone()),
            Attr::Ints(v) => Ok(to_shape(v)),
            other => Err(Self::wrong(name, "shape", other)),
        }
    }

    pub fn get_tensor(&self, name: &str) -> MoResult<&Arc<Tensor>> {
        match self.expect(name)? {
            Attr::Tensor(t) => Ok(t),
            other => Err(Self::wrong(name, "tensor", other)),
        }
    }

    pub fn get_opt_int(&self, name: &str) -> MoResult<Option<i64>> {
        if self.contains(name) { self.get_int(name).map(Some) } else { Ok(None) }
    }

    pub fn get_opt_float(&self, name: &str) -> MoResult<Option<f64>> {
        if self.contains(name) { self.get_float(name).map(Some) } else { Ok(None) }
    }

    pub fn get_opt_bool(&self, name: &str) -> MoResult<Option<bool>> {
        if self.contains(name) { self.get_bool(name).map(Some) } else { Ok(None) }
    }

    pub fn get_opt_str(&self, name: &str) -> MoResult<Option<&str>> {
        if self.contains(name) { self.get_str(name).map(Some) } else { Ok(None) }
    }

    pub fn get_opt_ints(&self, name: &str) -> MoResult<Option<TVec<i64>>> {
        if self.contains(name) { self.get_ints(name).map(Some) } else { Ok(None) }
    }
}

impl<K: Into<String>, V: Into<Attr>> FromIterator<(K, V)> for Attrs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Attrs {
        Attrs(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<'a> IntoIterator for &'a Attrs {
    type Item = (&'a String, &'a Attr);
    type IntoIter = std::collections::btree_map::Iter<'a, String, Attr>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
