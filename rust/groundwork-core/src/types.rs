//! Type constraints and conversion.
//!
//! Conversions are strict one-way widenings: a value of type T1 converts to
//! T2 only where a well-defined widening exists. Number/string conversion is
//! permitted only in the explicit primitive positions below.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::value::{Number, Value, ValueKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Any,
    Bool,
    Number,
    String,
    List(Box<Type>),
    Set(Box<Type>),
    Map(Box<Type>),
    Tuple(Vec<Type>),
    Object {
        attrs: BTreeMap<String, Type>,
        optional: BTreeSet<String>,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("cannot convert {from} to {to}")]
    Incompatible { from: String, to: String },
    #[error("invalid number literal {0:?}")]
    InvalidNumber(String),
    #[error("required attribute {0:?} is missing")]
    MissingAttribute(String),
    #[error("tuple of length {got} where {want} elements are required")]
    TupleLength { got: usize, want: usize },
}

impl Type {
    pub fn object(attrs: BTreeMap<String, Type>) -> Type {
        Type::Object {
            attrs,
            optional: BTreeSet::new(),
        }
    }

    /// The most specific type describing `value`.
    pub fn of(value: &Value) -> Type {
        match &value.kind {
            ValueKind::Null => Type::Any,
            ValueKind::Bool(_) => Type::Bool,
            ValueKind::Number(_) => Type::Number,
            ValueKind::String(_) => Type::String,
            ValueKind::List(items) => Type::List(Box::new(unify(items))),
            ValueKind::Set(items) => Type::Set(Box::new(unify(items))),
            ValueKind::Map(entries) => {
                let items: Vec<Value> = entries.values().cloned().collect();
                Type::Map(Box::new(unify(&items)))
            }
            ValueKind::Tuple(items) => Type::Tuple(items.iter().map(Type::of).collect()),
            ValueKind::Object(attrs) => Type::Object {
                attrs: attrs.iter().map(|(k, v)| (k.clone(), Type::of(v))).collect(),
                optional: BTreeSet::new(),
            },
            ValueKind::Unknown(ty) => ty.clone(),
        }
    }

    /// The element type for values nested under this collection type.
    pub fn element(&self) -> Type {
        match self {
            Type::List(e) | Type::Set(e) | Type::Map(e) => (**e).clone(),
            _ => Type::Any,
        }
    }

    /// External JSON encoding: primitives as strings, complex types as
    /// arrays, `any` as "dynamic".
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Type::Any => json!("dynamic"),
            Type::Bool => json!("bool"),
            Type::Number => json!("number"),
            Type::String => json!("string"),
            Type::List(e) => json!(["list", e.to_json()]),
            Type::Set(e) => json!(["set", e.to_json()]),
            Type::Map(e) => json!(["map", e.to_json()]),
            Type::Tuple(elems) => {
                let elems: Vec<serde_json::Value> = elems.iter().map(|t| t.to_json()).collect();
                json!(["tuple", elems])
            }
            Type::Object { attrs, optional } => {
                let attrs: serde_json::Map<String, serde_json::Value> = attrs
                    .iter()
                    .map(|(k, t)| (k.clone(), t.to_json()))
                    .collect();
                if optional.is_empty() {
                    json!(["object", attrs])
                } else {
                    let opt: Vec<&String> = optional.iter().collect();
                    json!(["object", attrs, opt])
                }
            }
        }
    }

    /// Inverse of [`Type::to_json`].
    pub fn from_json(json: &serde_json::Value) -> Result<Type, ConversionError> {
        let fail = || ConversionError::Incompatible {
            from: json.to_string(),
            to: "type".to_string(),
        };
        match json {
            serde_json::Value::String(s) => match s.as_str() {
                "dynamic" | "any" => Ok(Type::Any),
                "bool" => Ok(Type::Bool),
                "number" => Ok(Type::Number),
                "string" => Ok(Type::String),
                _ => Err(fail()),
            },
            serde_json::Value::Array(parts) => {
                let kind = parts.first().and_then(|v| v.as_str()).ok_or_else(fail)?;
                match kind {
                    "list" | "set" | "map" => {
                        let elem = Type::from_json(parts.get(1).ok_or_else(fail)?)?;
                        Ok(match kind {
                            "list" => Type::List(Box::new(elem)),
                            "set" => Type::Set(Box::new(elem)),
                            _ => Type::Map(Box::new(elem)),
                        })
                    }
                    "tuple" => {
                        let elems = parts
                            .get(1)
                            .and_then(|v| v.as_array())
                            .ok_or_else(fail)?
                            .iter()
                            .map(Type::from_json)
                            .collect::<Result<Vec<_>, _>>()?;
                        Ok(Type::Tuple(elems))
                    }
                    "object" => {
                        let attrs = parts
                            .get(1)
                            .and_then(|v| v.as_object())
                            .ok_or_else(fail)?
                            .iter()
                            .map(|(k, v)| Ok((k.clone(), Type::from_json(v)?)))
                            .collect::<Result<BTreeMap<_, _>, ConversionError>>()?;
                        let optional = match parts.get(2) {
                            Some(serde_json::Value::Array(names)) => names
                                .iter()
                                .filter_map(|v| v.as_str().map(String::from))
                                .collect(),
                            _ => BTreeSet::new(),
                        };
                        Ok(Type::Object { attrs, optional })
                    }
                    _ => Err(fail()),
                }
            }
            _ => Err(fail()),
        }
    }
}

impl serde::Serialize for Type {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Type {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Type::from_json(&json).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Any => write!(f, "any"),
            Type::Bool => write!(f, "bool"),
            Type::Number => write!(f, "number"),
            Type::String => write!(f, "string"),
            Type::List(e) => write!(f, "list({})", e),
            Type::Set(e) => write!(f, "set({})", e),
            Type::Map(e) => write!(f, "map({})", e),
            Type::Tuple(elems) => {
                write!(f, "tuple([")?;
                for (i, e) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, "])")
            }
            Type::Object { attrs, .. } => {
                write!(f, "object({{")?;
                for (i, (k, t)) in attrs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} = {}", k, t)?;
                }
                write!(f, "}})")
            }
        }
    }
}

/// The common supertype of a list of values.
fn unify(items: &[Value]) -> Type {
    let mut it = items.iter().map(Type::of);
    let first = match it.next() {
        Some(t) => t,
        None => return Type::Any,
    };
    it.fold(first, |acc, t| if acc == t { acc } else { Type::Any })
}

/// Converts `value` to `ty`, preserving marks. Unknown values convert to an
/// unknown of the target type.
pub fn convert(value: &Value, ty: &Type) -> Result<Value, ConversionError> {
    let marks = value.marks;
    if value.is_null() {
        return Ok(value.clone());
    }
    if value.is_unknown() {
        return Ok(Value::unknown(ty.clone()).with_marks(marks));
    }
    let incompatible = || ConversionError::Incompatible {
        from: Type::of(value).to_string(),
        to: ty.to_string(),
    };

    let converted = match (ty, &value.kind) {
        (Type::Any, _) => value.clone(),
        (Type::Bool, ValueKind::Bool(_)) => value.clone(),
        (Type::Bool, ValueKind::String(s)) => match s.as_str() {
            "true" => Value::bool(true),
            "false" => Value::bool(false),
            _ => return Err(incompatible()),
        },
        (Type::Number, ValueKind::Number(_)) => value.clone(),
        (Type::Number, ValueKind::String(s)) => {
            if let Ok(i) = s.parse::<i64>() {
                Value::int(i)
            } else if let Ok(f) = s.parse::<f64>() {
                Value::float(f)
            } else {
                return Err(ConversionError::InvalidNumber(s.clone()));
            }
        }
        (Type::String, ValueKind::String(_)) => value.clone(),
        (Type::String, ValueKind::Number(n)) => Value::string(n.to_string()),
        (Type::String, ValueKind::Bool(b)) => Value::string(if *b { "true" } else { "false" }),
        (Type::List(ety), ValueKind::List(items))
        | (Type::List(ety), ValueKind::Tuple(items))
        | (Type::List(ety), ValueKind::Set(items)) => Value::list(
            items
                .iter()
                .map(|e| convert(e, ety))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        (Type::Set(ety), ValueKind::List(items))
        | (Type::Set(ety), ValueKind::Tuple(items))
        | (Type::Set(ety), ValueKind::Set(items)) => Value::set(
            items
                .iter()
                .map(|e| convert(e, ety))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        (Type::Tuple(etys), ValueKind::Tuple(items))
        | (Type::Tuple(etys), ValueKind::List(items)) => {
            if etys.len() != items.len() {
                return Err(ConversionError::TupleLength {
                    got: items.len(),
                    want: etys.len(),
                });
            }
            Value::tuple(
                items
                    .iter()
                    .zip(etys.iter())
                    .map(|(e, t)| convert(e, t))
                    .collect::<Result<Vec<_>, _>>()?,
            )
        }
        (Type::Map(ety), ValueKind::Map(entries))
        | (Type::Map(ety), ValueKind::Object(entries)) => Value::map(
            entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), convert(v, ety)?)))
                .collect::<Result<BTreeMap<_, _>, ConversionError>>()?,
        ),
        (Type::Object { attrs, optional }, ValueKind::Object(entries))
        | (Type::Object { attrs, optional }, ValueKind::Map(entries)) => {
            let mut out = BTreeMap::new();
            for (name, aty) in attrs {
                match entries.get(name) {
                    Some(v) => {
                        out.insert(name.clone(), convert(v, aty)?);
                    }
                    None if optional.contains(name) => {
                        out.insert(name.clone(), Value::null());
                    }
                    None => return Err(ConversionError::MissingAttribute(name.clone())),
                }
            }
            Value::object(out)
        }
        _ => return Err(incompatible()),
    };
    Ok(converted.with_marks(marks))
}
