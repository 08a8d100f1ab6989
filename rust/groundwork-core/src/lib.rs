pub mod addr;
pub mod diag;
pub mod types;
pub mod value;

pub use addr::{InstanceAddr, InstanceKey, ModulePath, ResourceAddr, ResourceMode};
pub use diag::{Diagnostic, Diagnostics, Severity, SourceRange};
pub use types::Type;
pub use value::{Marks, Number, Path, PathStep, Value, ValueKind};
