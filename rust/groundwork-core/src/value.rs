//! Dynamic value representation.
//!
//! The engine operates on the following data types:
//! - null
//! - boolean (true/false)
//! - number (exact over i64, otherwise f64)
//! - string (utf-8)
//! - list / set / tuple (sequences of values)
//! - map / object (string-keyed, order-canonicalized)
//!
//! Additionally there is `unknown(T)`: a value whose type is settled but whose
//! concrete content only becomes available after apply.
//!
//! Every value node carries two side-band marks, [`Marks`]:
//! - `sensitive`: must never appear unredacted in logs or diagnostics
//! - `deferred`: derived from a value that resolves only at apply time
//!
//! Marks propagate: the result of any operation carries the union of the marks
//! of every input that contributed to it.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::Type;

/// Scalar numbers, exact for integers within i64.
#[derive(Debug, Clone, Copy)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Number::Int(i) => Some(*i),
            Number::Float(f) => {
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    Some(*f as i64)
                } else {
                    None
                }
            }
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Number::Int(i) => *i as f64,
            Number::Float(f) => *f,
        }
    }

    pub fn to_json(&self) -> serde_json::Number {
        match self {
            Number::Int(i) => serde_json::Number::from(*i),
            Number::Float(f) => serde_json::Number::from_f64(*f)
                .unwrap_or_else(|| serde_json::Number::from(0)),
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a == b,
            _ => self.as_f64() == other.as_f64(),
        }
    }
}
impl Eq for Number {}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Number {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a.cmp(b),
            _ => self.as_f64().total_cmp(&other.as_f64()),
        }
    }
}

impl From<i64> for Number {
    fn from(i: i64) -> Self {
        Number::Int(i)
    }
}
impl From<f64> for Number {
    fn from(f: f64) -> Self {
        Number::Float(f)
    }
}

impl std::fmt::Display for Number {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Number::Int(i) => write!(f, "{}", i),
            Number::Float(x) => write!(f, "{}", x),
        }
    }
}

/// Side-band marks carried by every value node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Marks {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sensitive: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deferred: bool,
}

impl Marks {
    pub const NONE: Marks = Marks {
        sensitive: false,
        deferred: false,
    };

    pub fn sensitive() -> Marks {
        Marks {
            sensitive: true,
            deferred: false,
        }
    }

    pub fn union(self, other: Marks) -> Marks {
        Marks {
            sensitive: self.sensitive || other.sensitive,
            deferred: self.deferred || other.deferred,
        }
    }

    pub fn is_none(&self) -> bool {
        !self.sensitive && !self.deferred
    }
}

/// The value sum. `Unknown` carries the settled type of the eventual value.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueKind {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    List(Vec<Value>),
    /// Kept sorted and deduplicated; see [`Value::set`].
    Set(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Tuple(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Unknown(Type),
}

/// A dynamic value: the sum plus its marks.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub kind: ValueKind,
    pub marks: Marks,
}

impl Value {
    pub fn new(kind: ValueKind) -> Value {
        Value {
            kind,
            marks: Marks::NONE,
        }
    }

    pub fn null() -> Value {
        Value::new(ValueKind::Null)
    }

    pub fn bool(b: bool) -> Value {
        Value::new(ValueKind::Bool(b))
    }

    pub fn int(i: i64) -> Value {
        Value::new(ValueKind::Number(Number::Int(i)))
    }

    pub fn float(f: f64) -> Value {
        Value::new(ValueKind::Number(Number::Float(f)))
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value::new(ValueKind::String(s.into()))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::new(ValueKind::List(items))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::new(ValueKind::Tuple(items))
    }

    /// Builds a set value: elements are sorted and deduplicated by their
    /// unmarked content, with marks of duplicates unioned into the survivor.
    pub fn set(items: Vec<Value>) -> Value {
        let mut out: Vec<Value> = Vec::with_capacity(items.len());
        for item in items {
            match out
                .iter_mut()
                .find(|e| e.without_marks() == item.without_marks())
            {
                Some(existing) => existing.marks = existing.marks.union(item.marks),
                None => out.push(item),
            }
        }
        out.sort_by(|a, b| a.canonical_cmp(b));
        Value::new(ValueKind::Set(out))
    }

    pub fn map(entries: BTreeMap<String, Value>) -> Value {
        Value::new(ValueKind::Map(entries))
    }

    pub fn object(attrs: BTreeMap<String, Value>) -> Value {
        Value::new(ValueKind::Object(attrs))
    }

    pub fn unknown(ty: Type) -> Value {
        Value {
            kind: ValueKind::Unknown(ty),
            marks: Marks {
                sensitive: false,
                deferred: true,
            },
        }
    }

    pub fn with_marks(mut self, marks: Marks) -> Value {
        self.marks = self.marks.union(marks);
        self
    }

    pub fn mark_sensitive(self) -> Value {
        self.with_marks(Marks::sensitive())
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self.kind, ValueKind::Unknown(_))
    }

    /// True if this value or any nested value is unknown.
    pub fn contains_unknown(&self) -> bool {
        let mut found = false;
        self.walk(&mut |_, v| {
            if v.is_unknown() {
                found = true;
            }
            !found
        });
        found
    }

    /// True if this value or any nested value is marked sensitive.
    pub fn contains_sensitive(&self) -> bool {
        let mut found = false;
        self.walk(&mut |_, v| {
            if v.marks.sensitive {
                found = true;
            }
            !found
        });
        found
    }

    pub fn as_bool(&self) -> Option<bool> {
        match &self.kind {
            ValueKind::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<Number> {
        match &self.kind {
            ValueKind::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The element count of a collection, if this is one.
    pub fn collection_len(&self) -> Option<usize> {
        match &self.kind {
            ValueKind::List(v) | ValueKind::Set(v) | ValueKind::Tuple(v) => Some(v.len()),
            ValueKind::Map(m) | ValueKind::Object(m) => Some(m.len()),
            ValueKind::String(s) => Some(s.chars().count()),
            _ => None,
        }
    }

    /// Deep copy with all marks removed. Comparisons that decide whether a
    /// value changed must ignore marks.
    pub fn without_marks(&self) -> Value {
        let kind = match &self.kind {
            ValueKind::List(v) => ValueKind::List(v.iter().map(|e| e.without_marks()).collect()),
            ValueKind::Set(v) => ValueKind::Set(v.iter().map(|e| e.without_marks()).collect()),
            ValueKind::Tuple(v) => ValueKind::Tuple(v.iter().map(|e| e.without_marks()).collect()),
            ValueKind::Map(m) => ValueKind::Map(
                m.iter()
                    .map(|(k, v)| (k.clone(), v.without_marks()))
                    .collect(),
            ),
            ValueKind::Object(m) => ValueKind::Object(
                m.iter()
                    .map(|(k, v)| (k.clone(), v.without_marks()))
                    .collect(),
            ),
            other => other.clone(),
        };
        Value::new(kind)
    }

    /// Total order over unmarked content, used for set canonicalization and
    /// stable serialization.
    pub fn canonical_cmp(&self, other: &Value) -> Ordering {
        fn rank(k: &ValueKind) -> u8 {
            match k {
                ValueKind::Null => 0,
                ValueKind::Bool(_) => 1,
                ValueKind::Number(_) => 2,
                ValueKind::String(_) => 3,
                ValueKind::List(_) => 4,
                ValueKind::Set(_) => 5,
                ValueKind::Map(_) => 6,
                ValueKind::Tuple(_) => 7,
                ValueKind::Object(_) => 8,
                ValueKind::Unknown(_) => 9,
            }
        }
        match (&self.kind, &other.kind) {
            (ValueKind::Bool(a), ValueKind::Bool(b)) => a.cmp(b),
            (ValueKind::Number(a), ValueKind::Number(b)) => a.cmp(b),
            (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
            (ValueKind::List(a), ValueKind::List(b))
            | (ValueKind::Set(a), ValueKind::Set(b))
            | (ValueKind::Tuple(a), ValueKind::Tuple(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let c = x.canonical_cmp(y);
                    if c != Ordering::Equal {
                        return c;
                    }
                }
                a.len().cmp(&b.len())
            }
            (ValueKind::Map(a), ValueKind::Map(b))
            | (ValueKind::Object(a), ValueKind::Object(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let c = ka.cmp(kb);
                    if c != Ordering::Equal {
                        return c;
                    }
                    let c = va.canonical_cmp(vb);
                    if c != Ordering::Equal {
                        return c;
                    }
                }
                a.len().cmp(&b.len())
            }
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }

    /// Visits every value node, parents before children, with its path from
    /// the root. The visitor returns false to stop descending.
    pub fn walk(&self, visitor: &mut impl FnMut(&Path, &Value) -> bool) {
        let mut path = Path::root();
        self.walk_at(&mut path, visitor);
    }

    fn walk_at(&self, path: &mut Path, visitor: &mut impl FnMut(&Path, &Value) -> bool) {
        if !visitor(path, self) {
            return;
        }
        match &self.kind {
            ValueKind::List(v) | ValueKind::Set(v) | ValueKind::Tuple(v) => {
                for (i, e) in v.iter().enumerate() {
                    path.0.push(PathStep::Index(i));
                    e.walk_at(path, visitor);
                    path.0.pop();
                }
            }
            ValueKind::Map(m) | ValueKind::Object(m) => {
                for (k, e) in m {
                    path.0.push(PathStep::Attr(k.clone()));
                    e.walk_at(path, visitor);
                    path.0.pop();
                }
            }
            _ => {}
        }
    }

    /// The value at `path`, if present.
    pub fn value_at(&self, path: &Path) -> Option<&Value> {
        let mut cur = self;
        for step in &path.0 {
            cur = match (&cur.kind, step) {
                (ValueKind::List(v), PathStep::Index(i))
                | (ValueKind::Set(v), PathStep::Index(i))
                | (ValueKind::Tuple(v), PathStep::Index(i)) => v.get(*i)?,
                (ValueKind::Map(m), PathStep::Attr(k))
                | (ValueKind::Object(m), PathStep::Attr(k)) => m.get(k)?,
                _ => return None,
            };
        }
        Some(cur)
    }

    /// Applies `marks` to the value at `path`; missing paths are ignored.
    pub fn mark_at(&mut self, path: &Path, marks: Marks) {
        fn descend(v: &mut Value, steps: &[PathStep], marks: Marks) {
            match steps.split_first() {
                None => v.marks = v.marks.union(marks),
                Some((step, rest)) => match (&mut v.kind, step) {
                    (ValueKind::List(items), PathStep::Index(i))
                    | (ValueKind::Set(items), PathStep::Index(i))
                    | (ValueKind::Tuple(items), PathStep::Index(i)) => {
                        if let Some(e) = items.get_mut(*i) {
                            descend(e, rest, marks);
                        }
                    }
                    (ValueKind::Map(entries), PathStep::Attr(k))
                    | (ValueKind::Object(entries), PathStep::Attr(k)) => {
                        if let Some(e) = entries.get_mut(k) {
                            descend(e, rest, marks);
                        }
                    }
                    _ => {}
                },
            }
        }
        descend(self, &path.0, marks);
    }

    /// Replaces the value at `path`; missing paths are ignored.
    pub fn set_at(&mut self, path: &Path, new_value: Value) {
        fn descend(v: &mut Value, steps: &[PathStep], new_value: Value) {
            match steps.split_first() {
                None => *v = new_value,
                Some((step, rest)) => match (&mut v.kind, step) {
                    (ValueKind::List(items), PathStep::Index(i))
                    | (ValueKind::Set(items), PathStep::Index(i))
                    | (ValueKind::Tuple(items), PathStep::Index(i)) => {
                        if let Some(e) = items.get_mut(*i) {
                            descend(e, rest, new_value);
                        }
                    }
                    (ValueKind::Map(entries), PathStep::Attr(k))
                    | (ValueKind::Object(entries), PathStep::Attr(k)) => {
                        if let Some(e) = entries.get_mut(k) {
                            descend(e, rest, new_value);
                        }
                    }
                    _ => {}
                },
            }
        }
        descend(self, &path.0, new_value);
    }

    /// Paths to every node carrying a sensitive mark.
    pub fn sensitive_paths(&self) -> Vec<Path> {
        let mut out = Vec::new();
        self.walk(&mut |p, v| {
            if v.marks.sensitive {
                out.push(p.clone());
            }
            true
        });
        out
    }

    /// Paths to every unknown node.
    pub fn unknown_paths(&self) -> Vec<Path> {
        let mut out = Vec::new();
        self.walk(&mut |p, v| {
            if v.is_unknown() {
                out.push(p.clone());
            }
            true
        });
        out
    }

    /// Plain JSON content with unknowns as null and marks dropped. The wire
    /// representation is this plus [`Value::unknown_paths`] and
    /// [`Value::sensitive_paths`]; see [`Value::from_wire`].
    pub fn to_wire_json(&self) -> serde_json::Value {
        match &self.kind {
            ValueKind::Null | ValueKind::Unknown(_) => serde_json::Value::Null,
            ValueKind::Bool(b) => serde_json::Value::Bool(*b),
            ValueKind::Number(n) => serde_json::Value::Number(n.to_json()),
            ValueKind::String(s) => serde_json::Value::String(s.clone()),
            ValueKind::List(v) | ValueKind::Set(v) | ValueKind::Tuple(v) => {
                serde_json::Value::Array(v.iter().map(|e| e.to_wire_json()).collect())
            }
            ValueKind::Map(m) | ValueKind::Object(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_wire_json())).collect(),
            ),
        }
    }

    /// Reconstructs a value from wire JSON plus its mark path lists, shaped by
    /// `ty`. The inverse of [`Value::to_wire_json`] up to set ordering.
    pub fn from_wire(
        json: &serde_json::Value,
        ty: &Type,
        unknown: &[Path],
        sensitive: &[Path],
    ) -> Value {
        let mut v = Value::from_json_typed(json, ty);
        for p in unknown {
            if let Some(elem_ty) = element_type_at(ty, p) {
                replace_with_unknown(&mut v, &p.0, elem_ty);
            }
        }
        for p in sensitive {
            v.mark_at(p, Marks::sensitive());
        }
        v
    }

    /// Maps plain JSON into a value, using `ty` to distinguish the shapes JSON
    /// cannot (set vs list vs tuple, map vs object).
    pub fn from_json_typed(json: &serde_json::Value, ty: &Type) -> Value {
        match json {
            serde_json::Value::Null => Value::null(),
            serde_json::Value::Bool(b) => Value::bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::int(i),
                None => Value::float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Value::string(s.clone()),
            serde_json::Value::Array(items) => {
                let elems = |ety: &Type| -> Vec<Value> {
                    items.iter().map(|e| Value::from_json_typed(e, ety)).collect()
                };
                match ty {
                    Type::Set(ety) => Value::set(elems(ety)),
                    Type::Tuple(etys) => Value::tuple(
                        items
                            .iter()
                            .enumerate()
                            .map(|(i, e)| {
                                Value::from_json_typed(e, etys.get(i).unwrap_or(&Type::Any))
                            })
                            .collect(),
                    ),
                    Type::List(ety) => Value::list(elems(ety)),
                    _ => Value::tuple(elems(&Type::Any)),
                }
            }
            serde_json::Value::Object(entries) => {
                let conv = |aty: fn(&Type, &str) -> Type| -> BTreeMap<String, Value> {
                    entries
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::from_json_typed(v, &aty(ty, k))))
                        .collect()
                };
                match ty {
                    Type::Map(_) => Value::map(conv(|t, _| match t {
                        Type::Map(e) => (**e).clone(),
                        _ => Type::Any,
                    })),
                    _ => Value::object(conv(|t, k| match t {
                        Type::Object { attrs, .. } => {
                            attrs.get(k).cloned().unwrap_or(Type::Any)
                        }
                        _ => Type::Any,
                    })),
                }
            }
        }
    }

    /// Nested JSON structure of booleans marking which leaves satisfy `pred`,
    /// in the shape used by `after_unknown` / `after_sensitive` rendering:
    /// collections whose every leaf is unmarked collapse to `false`.
    pub fn mark_structure(&self, pred: &impl Fn(&Value) -> bool) -> serde_json::Value {
        if pred(self) {
            return serde_json::Value::Bool(true);
        }
        match &self.kind {
            ValueKind::List(v) | ValueKind::Set(v) | ValueKind::Tuple(v) => {
                let children: Vec<serde_json::Value> =
                    v.iter().map(|e| e.mark_structure(pred)).collect();
                if children.iter().all(|c| c == &serde_json::Value::Bool(false)) {
                    serde_json::Value::Bool(false)
                } else {
                    serde_json::Value::Array(children)
                }
            }
            ValueKind::Map(m) | ValueKind::Object(m) => {
                let children: serde_json::Map<String, serde_json::Value> = m
                    .iter()
                    .filter_map(|(k, v)| {
                        let c = v.mark_structure(pred);
                        if c == serde_json::Value::Bool(false) {
                            None
                        } else {
                            Some((k.clone(), c))
                        }
                    })
                    .collect();
                if children.is_empty() {
                    serde_json::Value::Bool(false)
                } else {
                    serde_json::Value::Object(children)
                }
            }
            _ => serde_json::Value::Bool(false),
        }
    }
}

fn replace_with_unknown(v: &mut Value, steps: &[PathStep], ty: Type) {
    match steps.split_first() {
        None => {
            let marks = v.marks;
            *v = Value::unknown(ty).with_marks(marks);
        }
        Some((step, rest)) => match (&mut v.kind, step) {
            (ValueKind::List(items), PathStep::Index(i))
            | (ValueKind::Set(items), PathStep::Index(i))
            | (ValueKind::Tuple(items), PathStep::Index(i)) => {
                if let Some(e) = items.get_mut(*i) {
                    replace_with_unknown(e, rest, ty);
                }
            }
            (ValueKind::Map(entries), PathStep::Attr(k))
            | (ValueKind::Object(entries), PathStep::Attr(k)) => {
                if let Some(e) = entries.get_mut(k) {
                    replace_with_unknown(e, rest, ty);
                }
            }
            _ => {}
        },
    }
}

fn element_type_at(ty: &Type, path: &Path) -> Option<Type> {
    let mut cur = ty.clone();
    for step in &path.0 {
        cur = match (&cur, step) {
            (Type::List(e), PathStep::Index(_)) | (Type::Set(e), PathStep::Index(_)) => {
                (**e).clone()
            }
            (Type::Tuple(elems), PathStep::Index(i)) => elems.get(*i)?.clone(),
            (Type::Map(e), PathStep::Attr(_)) => (**e).clone(),
            (Type::Object { attrs, .. }, PathStep::Attr(k)) => {
                attrs.get(k).cloned().unwrap_or(Type::Any)
            }
            (Type::Any, _) => Type::Any,
            _ => return None,
        };
    }
    Some(cur)
}

/// One step into a structured value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathStep {
    Attr(String),
    Index(usize),
}

/// A path from the root of a value to a nested value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Path(pub Vec<PathStep>);

impl Path {
    pub fn root() -> Path {
        Path(Vec::new())
    }

    pub fn attr(name: impl Into<String>) -> Path {
        Path(vec![PathStep::Attr(name.into())])
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child_attr(&self, name: impl Into<String>) -> Path {
        let mut steps = self.0.clone();
        steps.push(PathStep::Attr(name.into()));
        Path(steps)
    }

    pub fn child_index(&self, index: usize) -> Path {
        let mut steps = self.0.clone();
        steps.push(PathStep::Index(index));
        Path(steps)
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for step in &self.0 {
            match step {
                PathStep::Attr(name) => write!(f, ".{}", name)?,
                PathStep::Index(i) => write!(f, "[{}]", i)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    #[test]
    fn set_canonicalizes_and_unions_marks() {
        let v = Value::set(vec![
            Value::string("b"),
            Value::string("a").mark_sensitive(),
            Value::string("a"),
        ]);
        match &v.kind {
            ValueKind::Set(items) => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].as_str(), Some("a"));
                assert!(items[0].marks.sensitive);
                assert_eq!(items[1].as_str(), Some("b"));
            }
            other => panic!("expected set, got {:?}", other),
        }
    }

    #[test]
    fn wire_round_trip_preserves_marks() {
        let mut attrs = BTreeMap::new();
        attrs.insert("password".to_string(), Value::string("hunter2").mark_sensitive());
        attrs.insert("id".to_string(), Value::unknown(Type::String));
        attrs.insert("count".to_string(), Value::int(3));
        let v = Value::object(attrs);

        let json = v.to_wire_json();
        let unknown = v.unknown_paths();
        let sensitive = v.sensitive_paths();

        let ty = Type::Object {
            attrs: [
                ("password".to_string(), Type::String),
                ("id".to_string(), Type::String),
                ("count".to_string(), Type::Number),
            ]
            .into_iter()
            .collect(),
            optional: Default::default(),
        };
        let back = Value::from_wire(&json, &ty, &unknown, &sensitive);

        let pw = back.value_at(&Path::attr("password")).unwrap();
        assert!(pw.marks.sensitive);
        assert_eq!(pw.as_str(), Some("hunter2"));
        assert!(back.value_at(&Path::attr("id")).unwrap().is_unknown());
        assert_eq!(
            back.value_at(&Path::attr("count")).unwrap().as_number(),
            Some(Number::Int(3))
        );
    }

    #[test]
    fn mark_structure_collapses_unmarked_collections() {
        let mut attrs = BTreeMap::new();
        attrs.insert("password".to_string(), Value::string("x").mark_sensitive());
        attrs.insert("name".to_string(), Value::string("y"));
        let v = Value::object(attrs);
        let marks = v.mark_structure(&|v| v.marks.sensitive);
        assert_eq!(marks, serde_json::json!({"password": true}));

        let plain = Value::list(vec![Value::int(1), Value::int(2)]);
        assert_eq!(
            plain.mark_structure(&|v| v.marks.sensitive),
            serde_json::Value::Bool(false)
        );
    }

    #[test]
    fn unknown_is_deferred() {
        let v = Value::unknown(Type::Number);
        assert!(v.is_unknown());
        assert!(v.marks.deferred);
        assert!(v.contains_unknown());
    }

    #[test]
    fn value_at_and_mark_at() {
        let mut v = Value::list(vec![Value::string("a"), Value::string("b")]);
        let p = Path::root().child_index(1);
        v.mark_at(&p, Marks::sensitive());
        assert!(v.value_at(&p).unwrap().marks.sensitive);
        assert!(!v.value_at(&Path::root().child_index(0)).unwrap().marks.sensitive);
    }

    #[test]
    fn path_display() {
        let p = Path::attr("triggers").child_attr("x").child_index(0);
        assert_eq!(p.to_string(), ".triggers.x[0]");
    }
}
