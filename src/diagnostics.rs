use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum DiagnosticCode {
    SourceVanished,
    SourceUnreadable,
    DeclarationSyntax,
    BodySyntax,
    UnknownModule,
    UndeclaredModule,
    UnusedModule,
    UnknownBaseType,
    InheritanceCycle,
    AmbiguousBaseType,
    ShadowedField,
    ReservedTypeName,
    DuplicateMethod,
    DuplicateField,
    DefaultKindMismatch,
    HookSignature,
    NoHooks,
    NotABehaviour,
    EmitFailure,
    UnitSummary,
}

impl DiagnosticCode {
    pub fn id(self) -> &'static str {
        match self {
            DiagnosticCode::SourceVanished => "KS0001",
            DiagnosticCode::SourceUnreadable => "KS0002",
            DiagnosticCode::DeclarationSyntax => "KS0101",
            DiagnosticCode::BodySyntax => "KS0102",
            DiagnosticCode::UnknownModule => "KS0201",
            DiagnosticCode::UndeclaredModule => "KS0202",
            DiagnosticCode::UnusedModule => "KS0203",
            DiagnosticCode::UnknownBaseType => "KS0301",
            DiagnosticCode::InheritanceCycle => "KS0302",
            DiagnosticCode::AmbiguousBaseType => "KS0303",
            DiagnosticCode::ShadowedField => "KS0304",
            DiagnosticCode::ReservedTypeName => "KS0305",
            DiagnosticCode::DuplicateMethod => "KS0306",
            DiagnosticCode::DuplicateField => "KS0307",
            DiagnosticCode::DefaultKindMismatch => "KS0308",
            DiagnosticCode::HookSignature => "KS0401",
            DiagnosticCode::NoHooks => "KS0402",
            DiagnosticCode::NotABehaviour => "KS0403",
            DiagnosticCode::EmitFailure => "KS0501",
            DiagnosticCode::UnitSummary => "KS0900",
        }
    }

    /// Severity the pipeline reports this code with.
    pub fn default_severity(self) -> Severity {
        match self {
            DiagnosticCode::SourceVanished | DiagnosticCode::NotABehaviour | DiagnosticCode::UnitSummary => {
                Severity::Info
            }
            DiagnosticCode::UnusedModule | DiagnosticCode::NoHooks | DiagnosticCode::AmbiguousBaseType => {
                Severity::Warning
            }
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct SourceLocation {
    pub path: PathBuf,
    pub line: usize,
    pub column: usize,
}

impl SourceLocation {
    pub fn new(path: impl Into<PathBuf>, line: usize, column: usize) -> Self {
        Self { path: path.into(), line, column }
    }

    pub fn file_start(path: &Path) -> Self {
        Self::new(path, 1, 1)
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.path.display(), self.line, self.column)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: DiagnosticCode,
    pub message: String,
    pub location: SourceLocation,
}

impl Diagnostic {
    pub fn new(code: DiagnosticCode, location: SourceLocation, message: impl Into<String>) -> Self {
        Self { severity: code.default_severity(), code, message: message.into(), location }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}[{}]: {}", self.location, self.severity, self.code, self.message)
    }
}

/// Activation rule: a diagnostic list passes iff it carries no error.
pub fn passes(diagnostics: &[Diagnostic]) -> bool {
    !diagnostics.iter().any(Diagnostic::is_error)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticSummary {
    pub errors: usize,
    pub warnings: usize,
    pub infos: usize,
}

impl DiagnosticSummary {
    pub fn from_diagnostics(diagnostics: &[Diagnostic]) -> Self {
        let mut summary = Self::default();
        for diagnostic in diagnostics {
            match diagnostic.severity {
                Severity::Error => summary.errors += 1,
                Severity::Warning => summary.warnings += 1,
                Severity::Info => summary.infos += 1,
            }
        }
        summary
    }
}

impl fmt::Display for DiagnosticSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s), {} warning(s), {} info", self.errors, self.warnings, self.infos)
    }
}
