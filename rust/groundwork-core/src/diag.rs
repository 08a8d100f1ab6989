//! User-facing diagnostics.
//!
//! Engine operations that can partially succeed collect [`Diagnostic`]s
//! instead of failing on the first problem. Any Error-severity diagnostic
//! marks the run failed; warnings are reported and execution continues.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// A location in configuration source, where available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRange {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl SourceRange {
    pub fn file(filename: impl Into<String>) -> SourceRange {
        SourceRange {
            filename: filename.into(),
            line: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<SourceRange>,
}

impl Diagnostic {
    pub fn error(summary: impl Into<String>) -> Diagnostic {
        Diagnostic {
            severity: Severity::Error,
            summary: summary.into(),
            detail: None,
            range: None,
        }
    }

    pub fn warning(summary: impl Into<String>) -> Diagnostic {
        Diagnostic {
            severity: Severity::Warning,
            summary: summary.into(),
            detail: None,
            range: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Diagnostic {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_range(mut self, range: SourceRange) -> Diagnostic {
        self.range = Some(range);
        self
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.severity {
            Severity::Error => write!(f, "Error: {}", self.summary)?,
            Severity::Warning => write!(f, "Warning: {}", self.summary)?,
        }
        if let Some(range) = &self.range {
            write!(f, " (in {}", range.filename)?;
            if let Some(line) = range.line {
                write!(f, ":{}", line)?;
            }
            write!(f, ")")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "\n  {}", detail)?;
        }
        Ok(())
    }
}

/// An ordered collection of diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics(pub Vec<Diagnostic>);

impl Diagnostics {
    pub fn new() -> Diagnostics {
        Diagnostics(Vec::new())
    }

    pub fn push(&mut self, diag: Diagnostic) {
        self.0.push(diag);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.0.extend(other.0);
    }

    pub fn error(&mut self, summary: impl Into<String>) {
        self.push(Diagnostic::error(summary));
    }

    pub fn warning(&mut self, summary: impl Into<String>) {
        self.push(Diagnostic::warning(summary));
    }

    pub fn has_errors(&self) -> bool {
        self.0.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter()
    }

    /// Fails with an error summarizing all Error diagnostics, if any.
    pub fn into_result(self) -> Result<Diagnostics, DiagnosticsError> {
        if self.has_errors() {
            Err(DiagnosticsError(self))
        } else {
            Ok(self)
        }
    }
}

impl From<Diagnostic> for Diagnostics {
    fn from(d: Diagnostic) -> Self {
        Diagnostics(vec![d])
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Error-severity diagnostics promoted to a failure.
#[derive(Debug, Clone)]
pub struct DiagnosticsError(pub Diagnostics);

impl std::fmt::Display for DiagnosticsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let errors: Vec<&Diagnostic> = self
            .0
             .0
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .collect();
        write!(f, "{} error(s) occurred:", errors.len())?;
        for d in errors {
            write!(f, "\n- {}", d)?;
        }
        Ok(())
    }
}
impl std::error::Error for DiagnosticsError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_gates_failure() {
        let mut diags = Diagnostics::new();
        diags.warning("variable \"old\" is deprecated");
        assert!(!diags.has_errors());
        assert!(diags.clone().into_result().is_ok());

        diags.error("reference to undeclared variable");
        assert!(diags.has_errors());
        let err = diags.into_result().unwrap_err();
        assert!(err.to_string().contains("undeclared"));
    }

    #[test]
    fn display_includes_range() {
        let d = Diagnostic::error("unsupported block type")
            .with_range(SourceRange {
                filename: "main.gw.hcl".to_string(),
                line: Some(12),
            })
            .with_detail("blocks of type \"resources\" are not expected here");
        let s = d.to_string();
        assert!(s.contains("main.gw.hcl:12"));
        assert!(s.contains("not expected here"));
    }
}
