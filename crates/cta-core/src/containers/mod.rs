//! Per-event data model.
//!
//! Two kinds of containers live here:
//!
//! - **Scalar parameter containers** ([`HillasParameters`],
//!   [`ReconstructedEnergy`], ...) are flat structs of `Option` fields declared
//!   through the `container!` macro. Each carries static [`FieldMeta`] (name,
//!   type, unit, description) so writers can build columns and readers can
//!   rebuild the struct without per-type code.
//! - **The event record** ([`ArrayEvent`]) nests those containers together
//!   with the variable-length per-telescope payloads (waveforms, images).
//!
//! Missing values are `None`. There is no dynamic mapping anywhere; stage
//! contracts are expressed through [`DataField`].

use serde::{Deserialize, Serialize};

/// Declares a scalar parameter container.
///
/// ```ignore
/// container! {
///     /// Doc comment for the struct.
///     MyParameters, prefix = "my" {
///         width: f64, "m", "Width of the thing";
///     }
/// }
/// ```
macro_rules! container {
    (
        $(#[$meta:meta])*
        $name:ident, prefix = $prefix:literal {
            $( $field:ident : $ty:ty, $unit:literal, $desc:literal; )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
        pub struct $name {
            $(
                #[doc = $desc]
                pub $field: Option<$ty>,
            )+
        }

        impl $crate::containers::Container for $name {
            const PREFIX: &'static str = $prefix;

            fn fields() -> &'static [$crate::containers::FieldMeta] {
                const FIELDS: &[$crate::containers::FieldMeta] = &[
                    $(
                        $crate::containers::FieldMeta {
                            name: stringify!($field),
                            dtype: <$ty as $crate::containers::ScalarField>::DTYPE,
                            unit: $unit,
                            description: $desc,
                        },
                    )+
                ];
                FIELDS
            }

            fn values(&self) -> Vec<$crate::containers::FieldValue> {
                vec![
                    $( <$ty as $crate::containers::ScalarField>::into_value(self.$field), )+
                ]
            }

            fn from_values(values: &[$crate::containers::FieldValue]) -> Self {
                let mut values = values.iter();
                Self {
                    $(
                        $field: values
                            .next()
                            .and_then(|v| <$ty as $crate::containers::ScalarField>::from_value(*v)),
                    )+
                }
            }
        }
    };
}

mod event;
mod params;

pub use event::*;
pub use params::*;

/// Storage type of a scalar field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// 64-bit float.
    F64,
    /// 64-bit signed integer.
    I64,
    /// Boolean flag.
    Bool,
}

/// Static description of one scalar field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMeta {
    /// Field name without the container prefix.
    pub name: &'static str,
    /// Storage type.
    pub dtype: FieldType,
    /// Unit string (empty for dimensionless).
    pub unit: &'static str,
    /// Human readable description.
    pub description: &'static str,
}

/// A scalar value that may be missing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    /// Float value.
    F64(Option<f64>),
    /// Integer value.
    I64(Option<i64>),
    /// Boolean value.
    Bool(Option<bool>),
}

impl FieldValue {
    /// Numeric view used by quality queries and model features.
    ///
    /// Booleans map to 0/1. Missing values stay missing.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            FieldValue::F64(v) => v,
            FieldValue::I64(v) => v.map(|v| v as f64),
            FieldValue::Bool(v) => v.map(|b| if b { 1.0 } else { 0.0 }),
        }
    }

    /// True if no value is set.
    pub fn is_missing(&self) -> bool {
        match self {
            FieldValue::F64(v) => v.is_none(),
            FieldValue::I64(v) => v.is_none(),
            FieldValue::Bool(v) => v.is_none(),
        }
    }

    /// Missing value of the given type.
    pub fn missing(dtype: FieldType) -> Self {
        match dtype {
            FieldType::F64 => FieldValue::F64(None),
            FieldType::I64 => FieldValue::I64(None),
            FieldType::Bool => FieldValue::Bool(None),
        }
    }
}

/// Rust scalar types usable in a container.
pub trait ScalarField: Copy {
    /// Storage type tag.
    const DTYPE: FieldType;
    /// Wrap a value.
    fn into_value(value: Option<Self>) -> FieldValue;
    /// Unwrap a value of the matching type.
    fn from_value(value: FieldValue) -> Option<Self>;
}

impl ScalarField for f64 {
    const DTYPE: FieldType = FieldType::F64;

    fn into_value(value: Option<Self>) -> FieldValue {
        FieldValue::F64(value)
    }

    fn from_value(value: FieldValue) -> Option<Self> {
        match value {
            FieldValue::F64(v) => v,
            _ => None,
        }
    }
}

impl ScalarField for i64 {
    const DTYPE: FieldType = FieldType::I64;

    fn into_value(value: Option<Self>) -> FieldValue {
        FieldValue::I64(value)
    }

    fn from_value(value: FieldValue) -> Option<Self> {
        match value {
            FieldValue::I64(v) => v,
            _ => None,
        }
    }
}

impl ScalarField for bool {
    const DTYPE: FieldType = FieldType::Bool;

    fn into_value(value: Option<Self>) -> FieldValue {
        FieldValue::Bool(value)
    }

    fn from_value(value: FieldValue) -> Option<Self> {
        match value {
            FieldValue::Bool(v) => v,
            _ => None,
        }
    }
}

/// A flat container of optional scalar fields with static metadata.
///
/// Column names are `<PREFIX>_<field>`, e.g. `hillas_intensity`.
pub trait Container: Default + Clone {
    /// Column prefix.
    const PREFIX: &'static str;

    /// Field metadata in declaration order.
    fn fields() -> &'static [FieldMeta];

    /// Current values in declaration order.
    fn values(&self) -> Vec<FieldValue>;

    /// Rebuild from values in declaration order. Extra values are ignored,
    /// absent or mistyped ones become missing.
    fn from_values(values: &[FieldValue]) -> Self;

    /// Prefixed column name of a field.
    fn column_name(field: &FieldMeta) -> String {
        format!("{}_{}", Self::PREFIX, field.name)
    }

    /// Prefixed column names in declaration order.
    fn column_names() -> Vec<String> {
        Self::fields().iter().map(Self::column_name).collect()
    }

    /// Look up a value by prefixed column name.
    fn get(&self, column: &str) -> Option<FieldValue> {
        let name = column.strip_prefix(Self::PREFIX)?.strip_prefix('_')?;
        Self::fields()
            .iter()
            .position(|f| f.name == name)
            .and_then(|i| self.values().get(i).copied())
    }

    /// True if every field is missing.
    fn is_empty(&self) -> bool {
        self.values().iter().all(FieldValue::is_missing)
    }
}
