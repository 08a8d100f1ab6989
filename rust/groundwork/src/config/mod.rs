//! Configuration loader.
//!
//! Parses `*.gw.hcl` sources in a directory into a [`Module`] tree: variable,
//! output, locals, resource, data, module, provider and `engine` blocks.
//! Expressions are kept unevaluated; the evaluator resolves them against a
//! scope during planning.

pub mod variables;

use std::collections::BTreeMap;
use std::path::{Path as FsPath, PathBuf};

use groundwork_core::addr::{ModulePath, ResourceMode};
use groundwork_core::diag::{Diagnostic, Diagnostics, SourceRange};
use groundwork_core::types::Type;
use hcl::{Block, BlockLabel, Expression, Structure};

/// Variable names that collide with block-level meta-arguments.
pub const RESERVED_VARIABLE_NAMES: &[&str] = &[
    "source",
    "version",
    "providers",
    "count",
    "for_each",
    "lifecycle",
    "depends_on",
    "locals",
];

const CONFIG_SUFFIX: &str = ".gw.hcl";

#[derive(Debug, Clone)]
pub struct VariableConfig {
    pub name: String,
    pub r#type: Option<Type>,
    pub default: Option<Expression>,
    pub description: Option<String>,
    pub sensitive: bool,
    pub nullable: bool,
    pub deprecated: Option<String>,
    pub validations: Vec<ValidationRule>,
    pub range: SourceRange,
}

#[derive(Debug, Clone)]
pub struct ValidationRule {
    pub condition: Expression,
    pub error_message: Expression,
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub name: String,
    pub value: Expression,
    pub description: Option<String>,
    pub sensitive: bool,
    pub depends_on: Vec<String>,
    pub range: SourceRange,
}

#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    pub create_before_destroy: bool,
    pub prevent_destroy: bool,
    /// Attribute paths held at their prior value during planning.
    pub ignore_changes: Vec<String>,
    /// References whose change forces replacement of this resource.
    pub replace_triggered_by: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub condition: Expression,
    pub error_message: Expression,
}

#[derive(Debug, Clone)]
pub struct ResourceConfig {
    pub mode: ResourceMode,
    pub r#type: String,
    pub name: String,
    /// Local provider name; defaults to the type's prefix before the first
    /// underscore, or the whole type name.
    pub provider: Option<String>,
    pub count: Option<Expression>,
    pub for_each: Option<Expression>,
    pub body: BTreeMap<String, Expression>,
    pub lifecycle: Lifecycle,
    pub preconditions: Vec<Condition>,
    pub postconditions: Vec<Condition>,
    pub depends_on: Vec<String>,
    pub range: SourceRange,
}

impl ResourceConfig {
    pub fn provider_local_name(&self) -> &str {
        match &self.provider {
            Some(p) => p,
            None => self.r#type.split('_').next().unwrap_or(&self.r#type),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModuleCall {
    pub name: String,
    pub source: String,
    pub version: Option<String>,
    pub count: Option<Expression>,
    pub for_each: Option<Expression>,
    pub arguments: BTreeMap<String, Expression>,
    pub providers: BTreeMap<String, String>,
    pub range: SourceRange,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub local_name: String,
    pub body: BTreeMap<String, Expression>,
    pub range: SourceRange,
}

#[derive(Debug, Clone)]
pub struct ProviderRequirement {
    /// Source address, `hostname/namespace/type`.
    pub source: String,
    pub version_constraint: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub r#type: String,
    pub body: BTreeMap<String, Expression>,
}

#[derive(Debug, Clone, Default)]
pub struct EncryptionConfig {
    pub key_provider: Option<String>,
    pub body: BTreeMap<String, Expression>,
}

/// Contents of the `engine` block (`required_providers`, `required_version`,
/// `backend`, `encryption`).
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub required_version: Option<String>,
    pub required_providers: BTreeMap<String, ProviderRequirement>,
    pub backend: Option<BackendConfig>,
    pub encryption: Option<EncryptionConfig>,
}

#[derive(Debug, Clone, Default)]
pub struct Module {
    pub path: ModulePath,
    pub source_dir: PathBuf,
    pub variables: BTreeMap<String, VariableConfig>,
    pub outputs: BTreeMap<String, OutputConfig>,
    pub locals: BTreeMap<String, Expression>,
    pub resources: BTreeMap<String, ResourceConfig>,
    pub module_calls: BTreeMap<String, ModuleCall>,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub settings: Settings,
    pub children: BTreeMap<String, Module>,
}

impl Module {
    /// Key under which a resource block is registered in [`Module::resources`].
    pub fn resource_key(mode: ResourceMode, r#type: &str, name: &str) -> String {
        match mode {
            ResourceMode::Managed => format!("{}.{}", r#type, name),
            ResourceMode::Data => format!("data.{}.{}", r#type, name),
        }
    }

    /// Depth-first visit over this module and all children.
    pub fn walk_modules<'a>(&'a self, visit: &mut impl FnMut(&'a Module)) {
        visit(self);
        for child in self.children.values() {
            child.walk_modules(visit);
        }
    }

    pub fn descendant(&self, path: &ModulePath) -> Option<&Module> {
        let mut cur = self;
        for name in &path.0 {
            cur = cur.children.get(name)?;
        }
        Some(cur)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub root: Module,
}

/// Loads the module tree rooted at `dir`.
pub fn load_dir(dir: &FsPath) -> (Config, Diagnostics) {
    let mut diags = Diagnostics::new();
    let root = load_module(dir, ModulePath::root(), &mut diags, 0);
    (Config { root }, diags)
}

fn load_module(dir: &FsPath, path: ModulePath, diags: &mut Diagnostics, depth: usize) -> Module {
    let mut module = Module {
        path: path.clone(),
        source_dir: dir.to_path_buf(),
        ..Default::default()
    };

    if depth > 16 {
        diags.error(format!(
            "module nesting too deep at {}; possible module call cycle",
            dir.display()
        ));
        return module;
    }

    let mut files = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with(CONFIG_SUFFIX))
                    .unwrap_or(false)
            })
            .collect::<Vec<_>>(),
        Err(e) => {
            diags.error(format!("cannot read module directory {}: {}", dir.display(), e));
            return module;
        }
    };
    files.sort();

    if files.is_empty() {
        diags.error(format!(
            "no {} files found in {}",
            CONFIG_SUFFIX,
            dir.display()
        ));
        return module;
    }

    for file in files {
        let filename = file.display().to_string();
        tracing::debug!(path = %filename, "loading configuration file");
        let source = match std::fs::read_to_string(&file) {
            Ok(s) => s,
            Err(e) => {
                diags.push(
                    Diagnostic::error(format!("cannot read configuration file: {}", e))
                        .with_range(SourceRange::file(&filename)),
                );
                continue;
            }
        };
        let body = match hcl::parse(&source) {
            Ok(b) => b,
            Err(e) => {
                diags.push(
                    Diagnostic::error("invalid configuration syntax")
                        .with_detail(e.to_string())
                        .with_range(SourceRange::file(&filename)),
                );
                continue;
            }
        };
        load_body(&mut module, body, &filename, diags);
    }

    // Resolve module calls into child modules.
    let calls: Vec<ModuleCall> = module.module_calls.values().cloned().collect();
    for call in calls {
        let child_dir = dir.join(&call.source);
        if !child_dir.is_dir() {
            diags.push(
                Diagnostic::error(format!(
                    "module {:?} source {:?} is not a directory",
                    call.name, call.source
                ))
                .with_range(call.range.clone()),
            );
            continue;
        }
        let child = load_module(&child_dir, path.child(call.name.clone()), diags, depth + 1);
        module.children.insert(call.name.clone(), child);
    }

    module
}

fn load_body(module: &mut Module, body: hcl::Body, filename: &str, diags: &mut Diagnostics) {
    for structure in body {
        match structure {
            Structure::Attribute(attr) => {
                diags.push(
                    Diagnostic::error(format!(
                        "unexpected top-level attribute {:?}",
                        attr.key.as_str()
                    ))
                    .with_range(SourceRange::file(filename)),
                );
            }
            Structure::Block(block) => load_block(module, block, filename, diags),
        }
    }
}

fn load_block(module: &mut Module, block: Block, filename: &str, diags: &mut Diagnostics) {
    let range = SourceRange::file(filename);
    let ident = block.identifier.to_string();
    match ident.as_str() {
        "variable" => {
            if let Some(v) = decode_variable(block, &range, diags) {
                if module.variables.insert(v.name.clone(), v.clone()).is_some() {
                    diags.push(
                        Diagnostic::error(format!("duplicate variable {:?}", v.name))
                            .with_range(range),
                    );
                }
            }
        }
        "output" => {
            if let Some(o) = decode_output(block, &range, diags) {
                if module.outputs.insert(o.name.clone(), o.clone()).is_some() {
                    diags.push(
                        Diagnostic::error(format!("duplicate output {:?}", o.name))
                            .with_range(range),
                    );
                }
            }
        }
        "locals" => {
            for structure in block.body {
                match structure {
                    Structure::Attribute(attr) => {
                        module.locals.insert(attr.key.to_string(), attr.expr);
                    }
                    Structure::Block(_) => diags.push(
                        Diagnostic::error("blocks are not allowed inside locals")
                            .with_range(range.clone()),
                    ),
                }
            }
        }
        "resource" => {
            if let Some(r) = decode_resource(ResourceMode::Managed, block, &range, diags) {
                insert_resource(module, r, &range, diags);
            }
        }
        "data" => {
            if let Some(r) = decode_resource(ResourceMode::Data, block, &range, diags) {
                insert_resource(module, r, &range, diags);
            }
        }
        "module" => {
            if let Some(c) = decode_module_call(block, &range, diags) {
                if module.module_calls.insert(c.name.clone(), c.clone()).is_some() {
                    diags.push(
                        Diagnostic::error(format!("duplicate module call {:?}", c.name))
                            .with_range(range),
                    );
                }
            }
        }
        "provider" => {
            if let Some(p) = decode_provider(block, &range, diags) {
                if module.providers.insert(p.local_name.clone(), p.clone()).is_some() {
                    diags.push(
                        Diagnostic::error(format!(
                            "duplicate provider configuration {:?}",
                            p.local_name
                        ))
                        .with_range(range),
                    );
                }
            }
        }
        "engine" => decode_settings(module, block, &range, diags),
        other => {
            diags.push(
                Diagnostic::error(format!("unsupported block type {:?}", other))
                    .with_range(range),
            );
        }
    }
}

fn insert_resource(
    module: &mut Module,
    r: ResourceConfig,
    range: &SourceRange,
    diags: &mut Diagnostics,
) {
    let key = Module::resource_key(r.mode, &r.r#type, &r.name);
    if module.resources.insert(key.clone(), r).is_some() {
        diags.push(
            Diagnostic::error(format!("duplicate resource {:?}", key)).with_range(range.clone()),
        );
    }
}

fn single_label(block: &Block, what: &str, range: &SourceRange, diags: &mut Diagnostics) -> Option<String> {
    match block.labels.as_slice() {
        [label] => Some(label_str(label)),
        _ => {
            diags.push(
                Diagnostic::error(format!("{} blocks take exactly one label", what))
                    .with_range(range.clone()),
            );
            None
        }
    }
}

fn label_str(label: &BlockLabel) -> String {
    match label {
        BlockLabel::Identifier(id) => id.to_string(),
        BlockLabel::String(s) => s.clone(),
    }
}

fn expr_string(expr: &Expression) -> Option<String> {
    match expr {
        Expression::String(s) => Some(s.clone()),
        Expression::Variable(v) => Some(v.to_string()),
        Expression::Traversal(_) => Some(traversal_to_string(expr)),
        _ => None,
    }
}

/// Renders a reference expression like `null.a` or `var.x` back to text.
fn traversal_to_string(expr: &Expression) -> String {
    match expr {
        Expression::Variable(v) => v.to_string(),
        Expression::Traversal(t) => {
            let mut s = traversal_to_string(&t.expr);
            for op in &t.operators {
                match op {
                    hcl::TraversalOperator::GetAttr(name) => {
                        s.push('.');
                        s.push_str(name.as_str());
                    }
                    hcl::TraversalOperator::Index(Expression::Number(n)) => {
                        s.push_str(&format!("[{}]", n));
                    }
                    hcl::TraversalOperator::Index(Expression::String(k)) => {
                        s.push_str(&format!("[{:?}]", k));
                    }
                    _ => {}
                }
            }
            s
        }
        _ => String::new(),
    }
}

fn expr_bool(expr: &Expression) -> Option<bool> {
    match expr {
        Expression::Bool(b) => Some(*b),
        _ => None,
    }
}

fn expr_string_list(expr: &Expression) -> Option<Vec<String>> {
    match expr {
        Expression::Array(items) => items.iter().map(expr_string).collect(),
        _ => None,
    }
}

fn decode_variable(
    block: Block,
    range: &SourceRange,
    diags: &mut Diagnostics,
) -> Option<VariableConfig> {
    let name = single_label(&block, "variable", range, diags)?;
    if RESERVED_VARIABLE_NAMES.contains(&name.as_str()) {
        diags.push(
            Diagnostic::error(format!("variable name {:?} is reserved", name))
                .with_range(range.clone()),
        );
        return None;
    }

    let mut v = VariableConfig {
        name: name.clone(),
        r#type: None,
        default: None,
        description: None,
        sensitive: false,
        nullable: true,
        deprecated: None,
        validations: Vec::new(),
        range: range.clone(),
    };

    for structure in block.body {
        match structure {
            Structure::Attribute(attr) => match attr.key.as_str() {
                "type" => match parse_type_expr(&attr.expr) {
                    Some(ty) => v.r#type = Some(ty),
                    None => diags.push(
                        Diagnostic::error(format!(
                            "invalid type constraint for variable {:?}",
                            name
                        ))
                        .with_range(range.clone()),
                    ),
                },
                "default" => v.default = Some(attr.expr),
                "description" => v.description = expr_string(&attr.expr),
                "sensitive" => v.sensitive = expr_bool(&attr.expr).unwrap_or(false),
                "nullable" => v.nullable = expr_bool(&attr.expr).unwrap_or(true),
                "deprecated" => v.deprecated = expr_string(&attr.expr),
                other => diags.push(
                    Diagnostic::error(format!(
                        "unsupported argument {:?} in variable {:?}",
                        other, name
                    ))
                    .with_range(range.clone()),
                ),
            },
            Structure::Block(inner) if inner.identifier.as_str() == "validation" => {
                match decode_condition(inner.body) {
                    Some((condition, error_message)) => v.validations.push(ValidationRule {
                        condition,
                        error_message,
                    }),
                    None => diags.push(
                        Diagnostic::error(format!(
                            "validation block in variable {:?} needs condition and error_message",
                            name
                        ))
                        .with_range(range.clone()),
                    ),
                }
            }
            Structure::Block(inner) => diags.push(
                Diagnostic::error(format!(
                    "unsupported block {:?} in variable {:?}",
                    inner.identifier.as_str(),
                    name
                ))
                .with_range(range.clone()),
            ),
        }
    }
    Some(v)
}

fn decode_condition(body: hcl::Body) -> Option<(Expression, Expression)> {
    let mut condition = None;
    let mut error_message = None;
    for structure in body {
        if let Structure::Attribute(attr) = structure {
            match attr.key.as_str() {
                "condition" => condition = Some(attr.expr),
                "error_message" => error_message = Some(attr.expr),
                _ => {}
            }
        }
    }
    Some((condition?, error_message?))
}

fn decode_output(
    block: Block,
    range: &SourceRange,
    diags: &mut Diagnostics,
) -> Option<OutputConfig> {
    let name = single_label(&block, "output", range, diags)?;
    let mut value = None;
    let mut description = None;
    let mut sensitive = false;
    let mut depends_on = Vec::new();

    for structure in block.body {
        if let Structure::Attribute(attr) = structure {
            match attr.key.as_str() {
                "value" => value = Some(attr.expr),
                "description" => description = expr_string(&attr.expr),
                "sensitive" => sensitive = expr_bool(&attr.expr).unwrap_or(false),
                "depends_on" => depends_on = expr_string_list(&attr.expr).unwrap_or_default(),
                other => diags.push(
                    Diagnostic::error(format!(
                        "unsupported argument {:?} in output {:?}",
                        other, name
                    ))
                    .with_range(range.clone()),
                ),
            }
        }
    }

    match value {
        Some(value) => Some(OutputConfig {
            name,
            value,
            description,
            sensitive,
            depends_on,
            range: range.clone(),
        }),
        None => {
            diags.push(
                Diagnostic::error(format!("output {:?} is missing its value argument", name))
                    .with_range(range.clone()),
            );
            None
        }
    }
}

fn decode_lifecycle(body: hcl::Body, range: &SourceRange, diags: &mut Diagnostics) -> Lifecycle {
    let mut lc = Lifecycle::default();
    for structure in body {
        if let Structure::Attribute(attr) = structure {
            match attr.key.as_str() {
                "create_before_destroy" => {
                    lc.create_before_destroy = expr_bool(&attr.expr).unwrap_or(false)
                }
                "prevent_destroy" => lc.prevent_destroy = expr_bool(&attr.expr).unwrap_or(false),
                "ignore_changes" => {
                    lc.ignore_changes = expr_string_list(&attr.expr).unwrap_or_default()
                }
                "replace_triggered_by" => {
                    lc.replace_triggered_by = expr_string_list(&attr.expr).unwrap_or_default()
                }
                other => diags.push(
                    Diagnostic::error(format!("unsupported lifecycle argument {:?}", other))
                        .with_range(range.clone()),
                ),
            }
        }
    }
    lc
}

fn decode_resource(
    mode: ResourceMode,
    block: Block,
    range: &SourceRange,
    diags: &mut Diagnostics,
) -> Option<ResourceConfig> {
    let (r#type, name) = match block.labels.as_slice() {
        [t, n] => (label_str(t), label_str(n)),
        _ => {
            diags.push(
                Diagnostic::error("resource blocks take two labels: type and name")
                    .with_range(range.clone()),
            );
            return None;
        }
    };

    let mut r = ResourceConfig {
        mode,
        r#type,
        name,
        provider: None,
        count: None,
        for_each: None,
        body: BTreeMap::new(),
        lifecycle: Lifecycle::default(),
        preconditions: Vec::new(),
        postconditions: Vec::new(),
        depends_on: Vec::new(),
        range: range.clone(),
    };

    for structure in block.body {
        match structure {
            Structure::Attribute(attr) => match attr.key.as_str() {
                "count" => r.count = Some(attr.expr),
                "for_each" => r.for_each = Some(attr.expr),
                "provider" => r.provider = expr_string(&attr.expr),
                "depends_on" => {
                    r.depends_on = expr_string_list(&attr.expr).unwrap_or_default()
                }
                _ => {
                    r.body.insert(attr.key.to_string(), attr.expr);
                }
            },
            Structure::Block(inner) => match inner.identifier.to_string().as_str() {
                "lifecycle" => r.lifecycle = decode_lifecycle(inner.body, range, diags),
                "precondition" => match decode_condition(inner.body) {
                    Some((condition, error_message)) => r.preconditions.push(Condition {
                        condition,
                        error_message,
                    }),
                    None => diags.push(
                        Diagnostic::error("precondition needs condition and error_message")
                            .with_range(range.clone()),
                    ),
                },
                "postcondition" => match decode_condition(inner.body) {
                    Some((condition, error_message)) => r.postconditions.push(Condition {
                        condition,
                        error_message,
                    }),
                    None => diags.push(
                        Diagnostic::error("postcondition needs condition and error_message")
                            .with_range(range.clone()),
                    ),
                },
                other => diags.push(
                    Diagnostic::error(format!(
                        "unsupported block {:?} in resource {}.{}",
                        other, r.r#type, r.name
                    ))
                    .with_range(range.clone()),
                ),
            },
        }
    }

    if r.count.is_some() && r.for_each.is_some() {
        diags.push(
            Diagnostic::error(format!(
                "resource {}.{} uses both count and for_each",
                r.r#type, r.name
            ))
            .with_range(range.clone()),
        );
    }

    Some(r)
}

fn decode_module_call(
    block: Block,
    range: &SourceRange,
    diags: &mut Diagnostics,
) -> Option<ModuleCall> {
    let name = single_label(&block, "module", range, diags)?;
    let mut call = ModuleCall {
        name: name.clone(),
        source: String::new(),
        version: None,
        count: None,
        for_each: None,
        arguments: BTreeMap::new(),
        providers: BTreeMap::new(),
        range: range.clone(),
    };

    for structure in block.body {
        match structure {
            Structure::Attribute(attr) => match attr.key.as_str() {
                "source" => call.source = expr_string(&attr.expr).unwrap_or_default(),
                "version" => call.version = expr_string(&attr.expr),
                "count" => call.count = Some(attr.expr),
                "for_each" => call.for_each = Some(attr.expr),
                "providers" => {
                    if let Expression::Object(entries) = &attr.expr {
                        for (k, v) in entries.iter() {
                            if let Some(v) = expr_string(v) {
                                call.providers.insert(object_key_str(k), v);
                            }
                        }
                    }
                }
                _ => {
                    call.arguments.insert(attr.key.to_string(), attr.expr);
                }
            },
            Structure::Block(inner) => diags.push(
                Diagnostic::error(format!(
                    "unsupported block {:?} in module {:?}",
                    inner.identifier.as_str(),
                    name
                ))
                .with_range(range.clone()),
            ),
        }
    }

    if call.source.is_empty() {
        diags.push(
            Diagnostic::error(format!("module {:?} is missing its source argument", name))
                .with_range(range.clone()),
        );
        return None;
    }
    Some(call)
}

fn object_key_str(key: &hcl::ObjectKey) -> String {
    match key {
        hcl::ObjectKey::Identifier(id) => id.to_string(),
        hcl::ObjectKey::Expression(Expression::String(s)) => s.clone(),
        hcl::ObjectKey::Expression(e) => traversal_to_string(e),
        _ => String::new(),
    }
}

fn decode_provider(
    block: Block,
    range: &SourceRange,
    diags: &mut Diagnostics,
) -> Option<ProviderConfig> {
    let local_name = single_label(&block, "provider", range, diags)?;
    let mut body = BTreeMap::new();
    for structure in block.body {
        if let Structure::Attribute(attr) = structure {
            body.insert(attr.key.to_string(), attr.expr);
        }
    }
    Some(ProviderConfig {
        local_name,
        body,
        range: range.clone(),
    })
}

fn decode_settings(module: &mut Module, block: Block, range: &SourceRange, diags: &mut Diagnostics) {
    for structure in block.body {
        match structure {
            Structure::Attribute(attr) => match attr.key.as_str() {
                "required_version" => {
                    module.settings.required_version = expr_string(&attr.expr);
                }
                other => diags.push(
                    Diagnostic::error(format!("unsupported engine argument {:?}", other))
                        .with_range(range.clone()),
                ),
            },
            Structure::Block(inner) => match inner.identifier.to_string().as_str() {
                "required_providers" => {
                    for structure in inner.body {
                        if let Structure::Attribute(attr) = structure {
                            let req = decode_provider_requirement(&attr.expr);
                            match req {
                                Some(req) => {
                                    module
                                        .settings
                                        .required_providers
                                        .insert(attr.key.to_string(), req);
                                }
                                None => diags.push(
                                    Diagnostic::error(format!(
                                        "invalid required_providers entry {:?}",
                                        attr.key.as_str()
                                    ))
                                    .with_range(range.clone()),
                                ),
                            }
                        }
                    }
                }
                "backend" => {
                    let r#type = match inner.labels.first() {
                        Some(label) => label_str(label),
                        None => {
                            diags.push(
                                Diagnostic::error("backend block takes one label")
                                    .with_range(range.clone()),
                            );
                            continue;
                        }
                    };
                    let mut body = BTreeMap::new();
                    for structure in inner.body {
                        if let Structure::Attribute(attr) = structure {
                            body.insert(attr.key.to_string(), attr.expr);
                        }
                    }
                    if module.settings.backend.is_some() {
                        diags.push(
                            Diagnostic::error("duplicate backend block").with_range(range.clone()),
                        );
                    }
                    module.settings.backend = Some(BackendConfig { r#type, body });
                }
                "encryption" => {
                    let mut enc = EncryptionConfig::default();
                    for structure in inner.body {
                        if let Structure::Attribute(attr) = structure {
                            if attr.key.as_str() == "key_provider" {
                                enc.key_provider = expr_string(&attr.expr);
                            } else {
                                enc.body.insert(attr.key.to_string(), attr.expr);
                            }
                        }
                    }
                    module.settings.encryption = Some(enc);
                }
                other => diags.push(
                    Diagnostic::error(format!("unsupported engine block {:?}", other))
                        .with_range(range.clone()),
                ),
            },
        }
    }
}

fn decode_provider_requirement(expr: &Expression) -> Option<ProviderRequirement> {
    match expr {
        Expression::Object(entries) => {
            let mut source = None;
            let mut version = None;
            for (k, v) in entries.iter() {
                match object_key_str(k).as_str() {
                    "source" => source = expr_string(v),
                    "version" => version = expr_string(v),
                    _ => {}
                }
            }
            Some(ProviderRequirement {
                source: source?,
                version_constraint: version,
            })
        }
        Expression::String(s) => Some(ProviderRequirement {
            source: s.clone(),
            version_constraint: None,
        }),
        _ => None,
    }
}

/// Parses a type constraint expression like `string`, `list(number)` or
/// `object({name = string})`.
fn parse_type_expr(expr: &Expression) -> Option<Type> {
    match expr {
        Expression::Variable(v) => match v.as_str() {
            "string" => Some(Type::String),
            "number" => Some(Type::Number),
            "bool" => Some(Type::Bool),
            "any" => Some(Type::Any),
            _ => None,
        },
        Expression::FuncCall(call) => {
            let args = &call.args;
            match call.name.to_string().as_str() {
                "list" => Some(Type::List(Box::new(parse_type_expr(args.first()?)?))),
                "set" => Some(Type::Set(Box::new(parse_type_expr(args.first()?)?))),
                "map" => Some(Type::Map(Box::new(parse_type_expr(args.first()?)?))),
                "tuple" => match args.first()? {
                    Expression::Array(elems) => Some(Type::Tuple(
                        elems.iter().map(parse_type_expr).collect::<Option<Vec<_>>>()?,
                    )),
                    _ => None,
                },
                "object" => match args.first()? {
                    Expression::Object(entries) => {
                        let attrs = entries
                            .iter()
                            .map(|(k, v)| Some((object_key_str(k), parse_type_expr(v)?)))
                            .collect::<Option<BTreeMap<_, _>>>()?;
                        Some(Type::object(attrs))
                    }
                    _ => None,
                },
                _ => None,
            }
        }
        _ => None,
    }
}
