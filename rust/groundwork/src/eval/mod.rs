//! Expression evaluation against a scope.
//!
//! The scope exposes `var`, `local`, `path`, `module`, `data`, managed
//! resource types, `each`, `count` and `self`. Evaluation propagates the
//! unknown sentinel and sensitive marks: any result derived from an unknown
//! input is unknown (with its type settled where possible), and any result
//! derived from a sensitive input is sensitive.

use std::collections::BTreeMap;

use groundwork_core::types::{convert, Type};
use groundwork_core::value::{Marks, Number, Value, ValueKind};
use hcl::{
    template::Element, BinaryOperator, Expression, Template, TraversalOperator, UnaryOperator,
};

/// Evaluation failure, rendered into a Diagnostic by callers.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("reference to unknown symbol {0:?}")]
    UnknownSymbol(String),
    #[error("attribute {0:?} not found")]
    NoSuchAttribute(String),
    #[error("index {0} out of range")]
    IndexOutOfRange(usize),
    #[error("invalid operand: {0}")]
    InvalidOperand(String),
    #[error("unsupported expression: {0}")]
    Unsupported(String),
    #[error("call to unknown function {0:?}")]
    UnknownFunction(String),
    #[error("invalid function argument: {0}")]
    InvalidArgument(String),
}

type EvalResult = Result<Value, EvalError>;

/// Everything an expression may refer to.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub vars: BTreeMap<String, Value>,
    pub locals: BTreeMap<String, Value>,
    pub path: BTreeMap<String, Value>,
    /// Managed resources: type name -> resource name -> value.
    pub managed: BTreeMap<String, BTreeMap<String, Value>>,
    /// Data resources: type name -> resource name -> value.
    pub data: BTreeMap<String, BTreeMap<String, Value>>,
    /// Child module outputs: module name -> object of outputs.
    pub modules: BTreeMap<String, Value>,
    /// `each.key` / `each.value` inside for_each expansion.
    pub each: Option<(Value, Value)>,
    /// `count.index` inside count expansion.
    pub count_index: Option<usize>,
    /// `self` inside postconditions.
    pub self_value: Option<Value>,
    /// Loop variables bound by an enclosing for expression.
    pub for_vars: BTreeMap<String, Value>,
}

impl Scope {
    pub fn with_var(mut self, name: impl Into<String>, value: Value) -> Scope {
        self.vars.insert(name.into(), value);
        self
    }

    fn resolve_root(&self, name: &str) -> EvalResult {
        if let Some(bound) = self.for_vars.get(name) {
            return Ok(bound.clone());
        }
        let from_map = |m: &BTreeMap<String, Value>| Value::object(m.clone());
        match name {
            "var" => Ok(from_map(&self.vars)),
            "local" => Ok(from_map(&self.locals)),
            "path" => Ok(from_map(&self.path)),
            "module" => Ok(from_map(&self.modules)),
            "data" => Ok(Value::object(
                self.data
                    .iter()
                    .map(|(ty, names)| (ty.clone(), Value::object(names.clone())))
                    .collect(),
            )),
            "each" => match &self.each {
                Some((key, value)) => Ok(Value::object(
                    [
                        ("key".to_string(), key.clone()),
                        ("value".to_string(), value.clone()),
                    ]
                    .into_iter()
                    .collect(),
                )),
                None => Err(EvalError::UnknownSymbol(
                    "each (outside for_each)".to_string(),
                )),
            },
            "count" => match self.count_index {
                Some(i) => Ok(Value::object(
                    [("index".to_string(), Value::int(i as i64))]
                        .into_iter()
                        .collect(),
                )),
                None => Err(EvalError::UnknownSymbol("count (outside count)".to_string())),
            },
            "self" => self
                .self_value
                .clone()
                .ok_or_else(|| EvalError::UnknownSymbol("self".to_string())),
            other => match self.managed.get(other) {
                Some(names) => Ok(Value::object(
                    names
                        .iter()
                        .map(|(name, v)| (name.clone(), v.clone()))
                        .collect(),
                )),
                None => Err(EvalError::UnknownSymbol(other.to_string())),
            },
        }
    }
}

/// A reference extracted from an expression, as path segments:
/// `var.x` -> ["var","x"], `null.a.id` -> ["null","a","id"].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reference(pub Vec<String>);

impl Reference {
    pub fn root(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or("")
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Statically extracts every reference in `expr`, for graph construction.
pub fn references(expr: &Expression) -> Vec<Reference> {
    let mut out = Vec::new();
    collect_references(expr, &mut out);
    out.sort();
    out.dedup();
    out
}

fn collect_references(expr: &Expression, out: &mut Vec<Reference>) {
    match expr {
        Expression::Variable(v) => out.push(Reference(vec![v.to_string()])),
        Expression::Traversal(t) => {
            let mut segments = Vec::new();
            if let Expression::Variable(root) = &t.expr {
                segments.push(root.to_string());
                for op in &t.operators {
                    match op {
                        TraversalOperator::GetAttr(name) => segments.push(name.to_string()),
                        _ => break,
                    }
                }
                out.push(Reference(segments));
            } else {
                collect_references(&t.expr, out);
            }
            for op in &t.operators {
                if let TraversalOperator::Index(e) = op {
                    collect_references(e, out);
                }
            }
        }
        Expression::Array(items) => {
            for e in items {
                collect_references(e, out);
            }
        }
        Expression::Object(entries) => {
            for (k, v) in entries.iter() {
                if let hcl::ObjectKey::Expression(e) = k {
                    collect_references(e, out);
                }
                collect_references(v, out);
            }
        }
        Expression::TemplateExpr(template_expr) => {
            if let Ok(template) = Template::from_expr(template_expr) {
                for element in template.elements() {
                    if let Element::Interpolation(interp) = element {
                        collect_references(&interp.expr, out);
                    }
                }
            }
        }
        Expression::Parenthesis(inner) => collect_references(inner, out),
        Expression::Conditional(cond) => {
            collect_references(&cond.cond_expr, out);
            collect_references(&cond.true_expr, out);
            collect_references(&cond.false_expr, out);
        }
        Expression::Operation(op) => match op.as_ref() {
            hcl::Operation::Unary(u) => collect_references(&u.expr, out),
            hcl::Operation::Binary(b) => {
                collect_references(&b.lhs_expr, out);
                collect_references(&b.rhs_expr, out);
            }
        },
        Expression::FuncCall(call) => {
            for e in &call.args {
                collect_references(e, out);
            }
        }
        Expression::ForExpr(f) => {
            collect_references(&f.collection_expr, out);
            collect_references(&f.value_expr, out);
            if let Some(e) = &f.key_expr {
                collect_references(e, out);
            }
            if let Some(e) = &f.cond_expr {
                collect_references(e, out);
            }
        }
        _ => {}
    }
}

/// Evaluates an expression that must not reference anything (defaults,
/// variable files).
pub fn eval_literal(expr: &Expression) -> Result<Value, String> {
    evaluate(expr, &Scope::default()).map_err(|e| e.to_string())
}

pub fn evaluate(expr: &Expression, scope: &Scope) -> EvalResult {
    match expr {
        Expression::Null => Ok(Value::null()),
        Expression::Bool(b) => Ok(Value::bool(*b)),
        Expression::Number(n) => Ok(number_value(n)),
        Expression::String(s) => Ok(Value::string(s.clone())),
        Expression::Array(items) => Ok(Value::tuple(
            items
                .iter()
                .map(|e| evaluate(e, scope))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        Expression::Object(entries) => {
            let mut out = BTreeMap::new();
            for (k, v) in entries.iter() {
                let key = match k {
                    hcl::ObjectKey::Identifier(id) => id.to_string(),
                    hcl::ObjectKey::Expression(e) => {
                        let kv = evaluate(e, scope)?;
                        match kv.as_str() {
                            Some(s) => s.to_string(),
                            None => {
                                return Err(EvalError::InvalidOperand(
                                    "object keys must be strings".to_string(),
                                ))
                            }
                        }
                    }
                    _ => {
                        return Err(EvalError::InvalidOperand(
                            "unsupported object key variant".to_string(),
                        ))
                    }
                };
                out.insert(key, evaluate(v, scope)?);
            }
            Ok(Value::object(out))
        }
        Expression::Variable(v) => scope.resolve_root(v.as_str()),
        Expression::Traversal(t) => {
            let base = evaluate(&t.expr, scope)?;
            apply_traversal(base, &t.operators, scope)
        }
        Expression::Parenthesis(inner) => evaluate(inner, scope),
        Expression::TemplateExpr(template_expr) => {
            let template = Template::from_expr(template_expr)
                .map_err(|e| EvalError::Unsupported(format!("template: {}", e)))?;
            eval_template(&template, scope)
        }
        Expression::Conditional(cond) => {
            let c = evaluate(&cond.cond_expr, scope)?;
            if c.is_unknown() {
                // Type is the unification of the branches when both evaluate.
                let marks = c.marks;
                return Ok(Value::unknown(Type::Any).with_marks(marks));
            }
            match c.as_bool() {
                Some(true) => evaluate(&cond.true_expr, scope).map(|v| v.with_marks(c.marks)),
                Some(false) => evaluate(&cond.false_expr, scope).map(|v| v.with_marks(c.marks)),
                None => Err(EvalError::InvalidOperand(
                    "condition must be a bool".to_string(),
                )),
            }
        }
        Expression::Operation(op) => match op.as_ref() {
            hcl::Operation::Unary(u) => eval_unary(u.operator, &evaluate(&u.expr, scope)?),
            hcl::Operation::Binary(b) => {
                let lhs = evaluate(&b.lhs_expr, scope)?;
                let rhs = evaluate(&b.rhs_expr, scope)?;
                eval_binary(&lhs, b.operator, &rhs)
            }
        },
        Expression::FuncCall(call) => {
            let args = call
                .args
                .iter()
                .map(|e| evaluate(e, scope))
                .collect::<Result<Vec<_>, _>>()?;
            call_function(&call.name.to_string(), &args)
        }
        Expression::ForExpr(f) => eval_for(f, scope),
        other => Err(EvalError::Unsupported(format!("{:?}", other))),
    }
}

fn number_value(n: &hcl::Number) -> Value {
    if let Some(i) = n.as_i64() {
        Value::int(i)
    } else {
        Value::float(n.as_f64().unwrap_or(0.0))
    }
}

fn apply_traversal(
    mut value: Value,
    operators: &[TraversalOperator],
    scope: &Scope,
) -> EvalResult {
    // Marks on containers flow into everything accessed through them.
    let mut carried = value.marks;
    for op in operators {
        if value.is_unknown() {
            return Ok(Value::unknown(Type::Any).with_marks(carried));
        }
        carried = carried.union(value.marks);
        value = match op {
            TraversalOperator::GetAttr(name) => match &value.kind {
                ValueKind::Object(attrs) | ValueKind::Map(attrs) => attrs
                    .get(name.as_str())
                    .cloned()
                    .ok_or_else(|| EvalError::NoSuchAttribute(name.to_string()))?,
                _ => {
                    return Err(EvalError::InvalidOperand(format!(
                        "cannot access attribute {:?} on a non-object value",
                        name.as_str()
                    )))
                }
            },
            TraversalOperator::Index(index_expr) => {
                let index = evaluate(index_expr, scope)?;
                carried = carried.union(index.marks);
                if index.is_unknown() {
                    return Ok(Value::unknown(Type::Any).with_marks(carried));
                }
                index_into(&value, &index)?
            }
            TraversalOperator::LegacyIndex(i) => {
                index_into(&value, &Value::int(*i as i64))?
            }
            TraversalOperator::AttrSplat | TraversalOperator::FullSplat => {
                return Err(EvalError::Unsupported("splat expressions".to_string()))
            }
        };
    }
    Ok(value.with_marks(carried))
}

fn index_into(value: &Value, index: &Value) -> EvalResult {
    match (&value.kind, &index.kind) {
        (ValueKind::List(items), ValueKind::Number(n))
        | (ValueKind::Tuple(items), ValueKind::Number(n)) => {
            let i = n
                .as_i64()
                .filter(|i| *i >= 0)
                .ok_or_else(|| EvalError::InvalidOperand("index must be an integer".to_string()))?
                as usize;
            items.get(i).cloned().ok_or(EvalError::IndexOutOfRange(i))
        }
        (ValueKind::Map(entries), ValueKind::String(k))
        | (ValueKind::Object(entries), ValueKind::String(k)) => entries
            .get(k)
            .cloned()
            .ok_or_else(|| EvalError::NoSuchAttribute(k.clone())),
        _ => Err(EvalError::InvalidOperand(
            "value cannot be indexed with this key".to_string(),
        )),
    }
}

fn eval_template(template: &Template, scope: &Scope) -> EvalResult {
    let mut out = String::new();
    let mut marks = Marks::NONE;
    let mut parts: Vec<Value> = Vec::new();

    for element in template.elements() {
        match element {
            Element::Literal(s) => {
                out.push_str(s);
                parts.push(Value::string(s.clone()));
            }
            Element::Interpolation(interp) => {
                let v = evaluate(&interp.expr, scope)?;
                marks = marks.union(v.marks);
                match &v.kind {
                    ValueKind::Unknown(_) => parts.push(v),
                    _ => {
                        let s = convert(&v, &Type::String).map_err(|e| {
                            EvalError::InvalidOperand(format!("cannot interpolate: {}", e))
                        })?;
                        out.push_str(s.as_str().unwrap_or(""));
                        marks = marks.union(s.marks);
                        parts.push(s);
                    }
                }
            }
            Element::Directive(_) => {
                return Err(EvalError::Unsupported("template directives".to_string()))
            }
        }
    }

    if parts.iter().any(|p| p.is_unknown()) {
        return Ok(Value::unknown(Type::String).with_marks(marks));
    }
    Ok(Value::string(out).with_marks(marks))
}

fn eval_unary(op: UnaryOperator, v: &Value) -> EvalResult {
    if v.is_unknown() {
        let ty = match op {
            UnaryOperator::Neg => Type::Number,
            UnaryOperator::Not => Type::Bool,
        };
        return Ok(Value::unknown(ty).with_marks(v.marks));
    }
    let out = match (op, &v.kind) {
        (UnaryOperator::Neg, ValueKind::Number(Number::Int(i))) => Value::int(-i),
        (UnaryOperator::Neg, ValueKind::Number(Number::Float(f))) => Value::float(-f),
        (UnaryOperator::Not, ValueKind::Bool(b)) => Value::bool(!b),
        _ => {
            return Err(EvalError::InvalidOperand(format!(
                "unary {:?} on incompatible value",
                op
            )))
        }
    };
    Ok(out.with_marks(v.marks))
}

fn eval_binary(lhs: &Value, op: BinaryOperator, rhs: &Value) -> EvalResult {
    use BinaryOperator::*;
    let marks = lhs.marks.union(rhs.marks);

    // Equality is defined even for unknowns only when both sides are known.
    if lhs.is_unknown() || rhs.is_unknown() {
        let ty = match op {
            Plus | Minus | Mul | Div | Mod => Type::Number,
            _ => Type::Bool,
        };
        return Ok(Value::unknown(ty).with_marks(marks));
    }

    let out = match op {
        Eq => Value::bool(lhs.without_marks() == rhs.without_marks()),
        NotEq => Value::bool(lhs.without_marks() != rhs.without_marks()),
        And | Or => {
            let (a, b) = match (lhs.as_bool(), rhs.as_bool()) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(EvalError::InvalidOperand(
                        "logical operators need bool operands".to_string(),
                    ))
                }
            };
            Value::bool(if op == And { a && b } else { a || b })
        }
        Plus | Minus | Mul | Div | Mod => {
            let (a, b) = match (lhs.as_number(), rhs.as_number()) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(EvalError::InvalidOperand(
                        "arithmetic needs number operands".to_string(),
                    ))
                }
            };
            match (a, b, op) {
                (Number::Int(x), Number::Int(y), Plus) => Value::int(x + y),
                (Number::Int(x), Number::Int(y), Minus) => Value::int(x - y),
                (Number::Int(x), Number::Int(y), Mul) => Value::int(x * y),
                (Number::Int(x), Number::Int(y), Mod) if y != 0 => Value::int(x % y),
                (a, b, Div) => {
                    if b.as_f64() == 0.0 {
                        return Err(EvalError::InvalidOperand("division by zero".to_string()));
                    }
                    Value::float(a.as_f64() / b.as_f64())
                }
                (a, b, Plus) => Value::float(a.as_f64() + b.as_f64()),
                (a, b, Minus) => Value::float(a.as_f64() - b.as_f64()),
                (a, b, Mul) => Value::float(a.as_f64() * b.as_f64()),
                (a, b, Mod) => {
                    if b.as_f64() == 0.0 {
                        return Err(EvalError::InvalidOperand("division by zero".to_string()));
                    }
                    Value::float(a.as_f64() % b.as_f64())
                }
                _ => unreachable!(),
            }
        }
        Less | LessEq | Greater | GreaterEq => {
            let (a, b) = match (lhs.as_number(), rhs.as_number()) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(EvalError::InvalidOperand(
                        "comparison needs number operands".to_string(),
                    ))
                }
            };
            let c = a.cmp(&b);
            Value::bool(match op {
                Less => c.is_lt(),
                LessEq => c.is_le(),
                Greater => c.is_gt(),
                GreaterEq => c.is_ge(),
                _ => unreachable!(),
            })
        }
    };
    Ok(out.with_marks(marks))
}

fn eval_for(f: &hcl::ForExpr, scope: &Scope) -> EvalResult {
    let collection = evaluate(&f.collection_expr, scope)?;
    if collection.is_unknown() {
        return Ok(Value::unknown(Type::Any).with_marks(collection.marks));
    }
    let marks = collection.marks;

    let entries: Vec<(Value, Value)> = match &collection.kind {
        ValueKind::List(items) | ValueKind::Set(items) | ValueKind::Tuple(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (Value::int(i as i64), v.clone()))
            .collect(),
        ValueKind::Map(m) | ValueKind::Object(m) => m
            .iter()
            .map(|(k, v)| (Value::string(k.clone()), v.clone()))
            .collect(),
        _ => {
            return Err(EvalError::InvalidOperand(
                "for expression needs a collection".to_string(),
            ))
        }
    };

    let mut items = Vec::new();
    let mut object = BTreeMap::new();
    for (key, value) in entries {
        let mut inner = scope.clone();
        if let Some(key_var) = &f.key_var {
            inner.for_vars.insert(key_var.to_string(), key.clone());
        }
        inner.for_vars.insert(f.value_var.to_string(), value.clone());

        if let Some(cond) = &f.cond_expr {
            let keep = evaluate(cond, &inner)?;
            if keep.is_unknown() {
                return Ok(Value::unknown(Type::Any).with_marks(marks));
            }
            if keep.as_bool() != Some(true) {
                continue;
            }
        }

        match &f.key_expr {
            Some(key_expr) => {
                let k = evaluate(key_expr, &inner)?;
                let v = evaluate(&f.value_expr, &inner)?;
                let k = match k.as_str() {
                    Some(s) => s.to_string(),
                    None => {
                        return Err(EvalError::InvalidOperand(
                            "for expression keys must be strings".to_string(),
                        ))
                    }
                };
                object.insert(k, v);
            }
            None => items.push(evaluate(&f.value_expr, &inner)?),
        }
    }

    if f.key_expr.is_some() {
        Ok(Value::object(object).with_marks(marks))
    } else {
        Ok(Value::tuple(items).with_marks(marks))
    }
}

fn call_function(name: &str, args: &[Value]) -> EvalResult {
    let marks = args.iter().fold(Marks::NONE, |m, a| m.union(a.marks));
    let arity = |n: usize| -> Result<(), EvalError> {
        if args.len() == n {
            Ok(())
        } else {
            Err(EvalError::InvalidArgument(format!(
                "{} takes {} argument(s), got {}",
                name,
                n,
                args.len()
            )))
        }
    };

    let out = match name {
        "length" => {
            arity(1)?;
            // Unknown collections still have an unknown length; unknown type
            // is permissive for type-preserving queries but the count itself
            // is not available.
            if args[0].is_unknown() {
                return Ok(Value::unknown(Type::Number).with_marks(marks));
            }
            match args[0].collection_len() {
                Some(n) => Value::int(n as i64),
                None => {
                    return Err(EvalError::InvalidArgument(
                        "length needs a collection or string".to_string(),
                    ))
                }
            }
        }
        "upper" | "lower" => {
            arity(1)?;
            if args[0].is_unknown() {
                return Ok(Value::unknown(Type::String).with_marks(marks));
            }
            let s = args[0]
                .as_str()
                .ok_or_else(|| EvalError::InvalidArgument(format!("{} needs a string", name)))?;
            Value::string(if name == "upper" {
                s.to_uppercase()
            } else {
                s.to_lowercase()
            })
        }
        "join" => {
            arity(2)?;
            if args.iter().any(|a| a.contains_unknown()) {
                return Ok(Value::unknown(Type::String).with_marks(marks));
            }
            let sep = args[0]
                .as_str()
                .ok_or_else(|| EvalError::InvalidArgument("join needs a string separator".to_string()))?;
            let items = match &args[1].kind {
                ValueKind::List(v) | ValueKind::Set(v) | ValueKind::Tuple(v) => v,
                _ => {
                    return Err(EvalError::InvalidArgument(
                        "join needs a list of strings".to_string(),
                    ))
                }
            };
            let mut parts = Vec::new();
            for item in items {
                let s = convert(item, &Type::String)
                    .map_err(|e| EvalError::InvalidArgument(e.to_string()))?;
                parts.push(s.as_str().unwrap_or("").to_string());
            }
            Value::string(parts.join(sep))
        }
        "concat" => {
            let mut out = Vec::new();
            for a in args {
                if a.is_unknown() {
                    return Ok(Value::unknown(Type::List(Box::new(Type::Any))).with_marks(marks));
                }
                match &a.kind {
                    ValueKind::List(v) | ValueKind::Set(v) | ValueKind::Tuple(v) => {
                        out.extend(v.iter().cloned())
                    }
                    _ => {
                        return Err(EvalError::InvalidArgument(
                            "concat needs list arguments".to_string(),
                        ))
                    }
                }
            }
            Value::tuple(out)
        }
        "merge" => {
            let mut out = BTreeMap::new();
            for a in args {
                if a.is_unknown() {
                    return Ok(Value::unknown(Type::Map(Box::new(Type::Any))).with_marks(marks));
                }
                match &a.kind {
                    ValueKind::Map(m) | ValueKind::Object(m) => {
                        out.extend(m.iter().map(|(k, v)| (k.clone(), v.clone())))
                    }
                    _ => {
                        return Err(EvalError::InvalidArgument(
                            "merge needs map arguments".to_string(),
                        ))
                    }
                }
            }
            Value::object(out)
        }
        "tostring" => {
            arity(1)?;
            convert(&args[0], &Type::String)
                .map_err(|e| EvalError::InvalidArgument(e.to_string()))?
        }
        "tonumber" => {
            arity(1)?;
            convert(&args[0], &Type::Number)
                .map_err(|e| EvalError::InvalidArgument(e.to_string()))?
        }
        _ => return Err(EvalError::UnknownFunction(name.to_string())),
    };
    Ok(out.with_marks(marks))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(src: &str) -> Expression {
        let body = hcl::parse(&format!("v = {}\n", src)).expect("must parse");
        for structure in body {
            if let hcl::Structure::Attribute(attr) = structure {
                return attr.expr;
            }
        }
        panic!("no attribute in source");
    }

    #[test]
    fn literals_and_arithmetic() {
        let scope = Scope::default();
        assert_eq!(evaluate(&expr("1 + 2"), &scope).unwrap(), Value::int(3));
        assert_eq!(
            evaluate(&expr(r#""a" == "a""#), &scope).unwrap(),
            Value::bool(true)
        );
        assert_eq!(
            evaluate(&expr("[1, 2, 3]"), &scope).unwrap(),
            Value::tuple(vec![Value::int(1), Value::int(2), Value::int(3)])
        );
    }

    #[test]
    fn variable_references() {
        let scope = Scope::default().with_var("name", Value::string("web"));
        assert_eq!(
            evaluate(&expr("var.name"), &scope).unwrap(),
            Value::string("web")
        );
        match evaluate(&expr("var.missing"), &scope) {
            Err(EvalError::NoSuchAttribute(a)) => assert_eq!(a, "missing"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn unknown_is_absorbing_for_arithmetic() {
        let scope = Scope::default().with_var("n", Value::unknown(Type::Number));
        let v = evaluate(&expr("var.n + 1"), &scope).unwrap();
        match &v.kind {
            ValueKind::Unknown(Type::Number) => {}
            other => panic!("expected unknown(number), got {:?}", other),
        }
    }

    #[test]
    fn length_of_unknown_list_is_unknown_number() {
        let scope = Scope::default()
            .with_var("xs", Value::unknown(Type::List(Box::new(Type::String))));
        let v = evaluate(&expr("length(var.xs)"), &scope).unwrap();
        assert_eq!(v.kind, ValueKind::Unknown(Type::Number));

        let known = Scope::default().with_var(
            "xs",
            Value::list(vec![Value::string("a"), Value::string("b")]),
        );
        assert_eq!(
            evaluate(&expr("length(var.xs)"), &known).unwrap(),
            Value::int(2)
        );
    }

    #[test]
    fn sensitive_marks_propagate() {
        let scope = Scope::default().with_var("pw", Value::string("hunter2").mark_sensitive());
        let v = evaluate(&expr("upper(var.pw)"), &scope).unwrap();
        assert!(v.marks.sensitive);
        assert_eq!(v.as_str(), Some("HUNTER2"));

        let t = evaluate(&expr(r#""secret: ${var.pw}""#), &scope).unwrap();
        assert!(t.marks.sensitive);
    }

    #[test]
    fn template_with_unknown_becomes_unknown_string() {
        let scope = Scope::default().with_var("id", Value::unknown(Type::String));
        let v = evaluate(&expr(r#""prefix-${var.id}""#), &scope).unwrap();
        assert_eq!(v.kind, ValueKind::Unknown(Type::String));
    }

    #[test]
    fn conditional_short_circuits_on_known_condition() {
        let scope = Scope::default().with_var("on", Value::bool(false));
        // The false branch would error if evaluated.
        let v = evaluate(&expr(r#"var.on ? var.never : "fallback""#), &scope).unwrap();
        assert_eq!(v.as_str(), Some("fallback"));
    }

    #[test]
    fn for_expression_over_map() {
        let scope = Scope::default().with_var(
            "tags",
            Value::map(
                [
                    ("a".to_string(), Value::string("1")),
                    ("b".to_string(), Value::string("2")),
                ]
                .into_iter()
                .collect(),
            ),
        );
        let v = evaluate(&expr("[for k, v in var.tags : k]"), &scope).unwrap();
        assert_eq!(
            v,
            Value::tuple(vec![Value::string("a"), Value::string("b")])
        );
    }

    #[test]
    fn reference_extraction() {
        let refs = references(&expr(
            r#"merge({a = var.x}, {b = null_thing.web.id}, {c = module.net.cidr})"#,
        ));
        let rendered: Vec<String> = refs.iter().map(|r| r.to_string()).collect();
        assert!(rendered.contains(&"var.x".to_string()));
        assert!(rendered.contains(&"null_thing.web.id".to_string()));
        assert!(rendered.contains(&"module.net.cidr".to_string()));
    }

    #[test]
    fn resource_references_resolve() {
        let mut scope = Scope::default();
        scope.managed.insert(
            "null".to_string(),
            [(
                "a".to_string(),
                Value::object(
                    [("id".to_string(), Value::string("x-1"))].into_iter().collect(),
                ),
            )]
            .into_iter()
            .collect(),
        );
        assert_eq!(
            evaluate(&expr("null.a.id"), &scope).unwrap(),
            Value::string("x-1")
        );
    }
}
