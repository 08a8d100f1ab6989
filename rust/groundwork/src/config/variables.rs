//! Variable value resolution.
//!
//! Values are gathered from lowest to highest precedence, last assignment
//! winning:
//!
//! 1. environment variables `GW_VAR_<name>`
//! 2. the canonical defaults file `groundwork.gwvars[.json]`
//! 3. `*.auto.gwvars[.json]` files, sorted lexically by file name
//! 4. explicit `-var-file` and `-var` arguments, in the order given
//!
//! Values for variables with no declaration: environment entries are
//! silently ignored, file entries produce a warning, command-line entries
//! are an error.

use std::collections::BTreeMap;
use std::path::{Path as FsPath, PathBuf};

use groundwork_core::diag::{Diagnostic, Diagnostics};
use groundwork_core::types::{convert, Type};
use groundwork_core::value::{Marks, Value};

use super::VariableConfig;
use crate::eval::eval_literal;

pub const ENV_VAR_PREFIX: &str = "GW_VAR_";
pub const DEFAULTS_FILE: &str = "groundwork.gwvars";
pub const AUTO_SUFFIX: &str = ".auto.gwvars";

/// One `-var` or `-var-file` argument, in command-line order.
#[derive(Debug, Clone)]
pub enum CliArg {
    /// `-var name=value`
    Var(String),
    /// `-var-file path`
    VarFile(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Origin {
    Environment,
    File(String),
    CommandLine,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Environment => write!(f, "environment"),
            Origin::File(name) => write!(f, "file {:?}", name),
            Origin::CommandLine => write!(f, "command line"),
        }
    }
}

/// Options controlling variable resolution behavior.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Group deprecation warnings by variable and message instead of
    /// emitting one per assignment.
    pub consolidate_warnings: bool,
}

/// Resolves final values for the root module's variables.
pub fn resolve(
    root_dir: &FsPath,
    declared: &BTreeMap<String, VariableConfig>,
    cli: &[CliArg],
    env: &[(String, String)],
    options: &Options,
) -> (BTreeMap<String, Value>, Diagnostics) {
    let mut diags = Diagnostics::new();
    let mut raw: BTreeMap<String, (Value, Origin)> = BTreeMap::new();

    // 1. Environment.
    for (key, raw_value) in env {
        if let Some(name) = key.strip_prefix(ENV_VAR_PREFIX) {
            if !declared.contains_key(name) {
                continue;
            }
            raw.insert(
                name.to_string(),
                (parse_flexible(raw_value), Origin::Environment),
            );
        }
    }

    // 2. Canonical defaults file, then 3. auto files.
    for path in auto_files(root_dir) {
        load_file(&path, declared, &mut raw, &mut diags, false);
    }

    // 4. Command-line arguments, in order.
    for arg in cli {
        match arg {
            CliArg::Var(assignment) => match assignment.split_once('=') {
                Some((name, raw_value)) => {
                    if !declared.contains_key(name) {
                        diags.error(format!(
                            "value for undeclared variable {:?} on the command line",
                            name
                        ));
                        continue;
                    }
                    raw.insert(
                        name.to_string(),
                        (parse_flexible(raw_value), Origin::CommandLine),
                    );
                }
                None => diags.error(format!(
                    "invalid -var argument {:?}: expected name=value",
                    assignment
                )),
            },
            CliArg::VarFile(path) => {
                load_file(path, declared, &mut raw, &mut diags, true);
            }
        }
    }

    // Bind declared variables.
    let mut values = BTreeMap::new();
    let mut deprecations: Vec<(String, String, Origin)> = Vec::new();
    for (name, decl) in declared {
        let bound = match raw.get(name) {
            Some((value, origin)) => {
                if let Some(message) = &decl.deprecated {
                    deprecations.push((name.clone(), message.clone(), origin.clone()));
                }
                Some(value.clone())
            }
            None => match &decl.default {
                Some(default) => match eval_literal(default) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        diags.push(
                            Diagnostic::error(format!(
                                "invalid default for variable {:?}",
                                name
                            ))
                            .with_detail(e)
                            .with_range(decl.range.clone()),
                        );
                        None
                    }
                },
                None => None,
            },
        };

        let value = match bound {
            Some(v) => v,
            None => {
                diags.push(
                    Diagnostic::error(format!("no value for required variable {:?}", name))
                        .with_range(decl.range.clone()),
                );
                continue;
            }
        };

        if value.is_null() && !decl.nullable {
            diags.push(
                Diagnostic::error(format!("variable {:?} may not be null", name))
                    .with_range(decl.range.clone()),
            );
            continue;
        }

        let mut value = match &decl.r#type {
            Some(ty) => match convert(&value, ty) {
                Ok(v) => v,
                Err(e) => {
                    diags.push(
                        Diagnostic::error(format!(
                            "invalid value for variable {:?}: {}",
                            name, e
                        ))
                        .with_range(decl.range.clone()),
                    );
                    continue;
                }
            },
            None => value,
        };
        if decl.sensitive {
            value = value.with_marks(Marks::sensitive());
        }
        values.insert(name.clone(), value);
    }

    emit_deprecations(deprecations, options, &mut diags);

    (values, diags)
}

fn emit_deprecations(
    deprecations: Vec<(String, String, Origin)>,
    options: &Options,
    diags: &mut Diagnostics,
) {
    if options.consolidate_warnings {
        let mut grouped: BTreeMap<(String, String), usize> = BTreeMap::new();
        for (name, message, _) in deprecations {
            *grouped.entry((name, message)).or_default() += 1;
        }
        for ((name, message), count) in grouped {
            let mut d =
                Diagnostic::warning(format!("variable {:?} is deprecated", name)).with_detail(message);
            if count > 1 {
                d.detail = Some(format!("{} ({} assignments)", d.detail.unwrap(), count));
            }
            diags.push(d);
        }
    } else {
        for (name, message, origin) in deprecations {
            diags.push(
                Diagnostic::warning(format!(
                    "variable {:?} is deprecated (assigned from {})",
                    name, origin
                ))
                .with_detail(message),
            );
        }
    }
}

/// The auto-loaded variable files, in precedence order.
fn auto_files(root_dir: &FsPath) -> Vec<PathBuf> {
    let mut defaults = Vec::new();
    let mut auto = Vec::new();
    let entries = match std::fs::read_dir(root_dir) {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        if name == DEFAULTS_FILE || name == format!("{}.json", DEFAULTS_FILE) {
            defaults.push(path);
        } else if name.ends_with(AUTO_SUFFIX) || name.ends_with(&format!("{}.json", AUTO_SUFFIX)) {
            auto.push(path);
        }
    }
    defaults.sort();
    auto.sort();
    defaults.extend(auto);
    defaults
}

fn load_file(
    path: &FsPath,
    declared: &BTreeMap<String, VariableConfig>,
    raw: &mut BTreeMap<String, (Value, Origin)>,
    diags: &mut Diagnostics,
    explicit: bool,
) {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("?")
        .to_string();
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            if explicit {
                diags.error(format!("cannot read variable file {:?}: {}", filename, e));
            }
            return;
        }
    };

    let entries: Vec<(String, Value)> = if filename.ends_with(".json") {
        match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&contents) {
            Ok(map) => map
                .into_iter()
                .map(|(k, v)| (k, Value::from_json_typed(&v, &Type::Any)))
                .collect(),
            Err(e) => {
                diags.error(format!("invalid JSON variable file {:?}: {}", filename, e));
                return;
            }
        }
    } else {
        let body = match hcl::parse(&contents) {
            Ok(b) => b,
            Err(e) => {
                diags.error(format!("invalid variable file {:?}: {}", filename, e));
                return;
            }
        };
        let mut out = Vec::new();
        for structure in body {
            match structure {
                hcl::Structure::Attribute(attr) => match eval_literal(&attr.expr) {
                    Ok(v) => out.push((attr.key.to_string(), v)),
                    Err(e) => diags.error(format!(
                        "invalid value for {:?} in {:?}: {}",
                        attr.key.as_str(),
                        filename,
                        e
                    )),
                },
                hcl::Structure::Block(_) => {
                    diags.error(format!(
                        "variable file {:?} may only contain attribute assignments",
                        filename
                    ));
                }
            }
        }
        out
    };

    for (name, value) in entries {
        if !declared.contains_key(&name) {
            diags.warning(format!(
                "value for undeclared variable {:?} in {:?}",
                name, filename
            ));
            continue;
        }
        raw.insert(name, (value, Origin::File(filename.clone())));
    }
}

/// Parses a raw string value: HCL literal syntax if it parses, else a plain
/// string.
fn parse_flexible(raw: &str) -> Value {
    if let Ok(body) = hcl::parse(&format!("v = {}\n", raw)) {
        for structure in body {
            if let hcl::Structure::Attribute(attr) = structure {
                if let Ok(v) = eval_literal(&attr.expr) {
                    return v;
                }
            }
        }
    }
    Value::string(raw)
}
