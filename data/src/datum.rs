//! Element types of tensors, placeholders and conversions.
use crate::internal::*;
use crate::tensor::Tensor;
use ndarray::ArrayD;
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Default)]
pub enum DatumType {
    Bool,
    U8,
    I32,
    I64,
    F16,
    #[default]
    F32,
    F64,
}

impl DatumType {
    pub fn is_float(&self) -> bool {
        matches!(self, DatumType::F16 | DatumType::F32 | DatumType::F64)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, DatumType::U8 | DatumType::I32 | DatumType::I64)
    }

    pub fn size_of(&self) -> usize {
        match self {
            DatumType::Bool | DatumType::U8 => 1,
            DatumType::F16 => 2,
            DatumType::I32 | DatumType::F32 => 4,
            DatumType::I64 | DatumType::F64 => 8,
        }
    }

    /// Element type name as the IR spells it in `Convert` and `Parameter`
    /// attributes.
    pub fn ir_name(&self) -> &'static str {
        match self {
            DatumType::Bool => "boolean",
            DatumType::U8 => "u8",
            DatumType::I32 => "i32",
            DatumType::I64 => "i64",
            DatumType::F16 => "f16",
            DatumType::F32 => "f32",
            DatumType::F64 => "f64",
        }
    }
}

impl fmt::Display for DatumType {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{self:?}")
    }
}

impl std::str::FromStr for DatumType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "I32" | "i32" | "int32" => Ok(DatumType::I32),
            "I64" | "i64" | "int64" | "long" => Ok(DatumType::I64),
            "U8" | "u8" | "uint8" => Ok(DatumType::U8),
            "F16" | "f16" | "float16" | "half" => Ok(DatumType::F16),
            "F32" | "f32" | "float32" | "float" => Ok(DatumType::F32),
            "F64" | "f64" | "float64" | "double" => Ok(DatumType::F64),
            "Bool" | "bool" | "boolean" => Ok(DatumType::Bool),
            _ => bail!("Unknown type {}", s),
        }
    }
}

pub trait Datum:
    Clone + Copy + Send + Sync + fmt::Debug + fmt::Display + Default + 'static + PartialEq
{
    fn name() -> &'static str;
    fn datum_type() -> DatumType;
    fn wrap(array: ArrayD<Self>) -> Tensor;
    fn array(tensor: &Tensor) -> Option<&ArrayD<Self>>;
}

macro_rules! datum {
    ($t:ty, $v:ident) => {
        impl Datum for $t {
            fn name() -> &'static str {
                stringify!($t)
            }

            fn datum_type() -> DatumType {
                DatumType::$v
            }

            fn wrap(array: ArrayD<Self>) -> Tensor {
                Tensor::$v(array)
            }

            fn array(tensor: &Tensor) -> Option<&ArrayD<Self>> {
                match tensor {
                    Tensor::$v(it) => Some(it),
                    _ => None,
                }
            }
        }
    };
}

datum!(bool, Bool);
datum!(u8, U8);
datum!(i32, I32);
datum!(i64, I64);
datum!(f32, F32);
datum!(f64, F64);
