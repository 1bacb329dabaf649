use anyhow::{anyhow, Context, Result};
use rhai::Position;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::diagnostics::SourceLocation;

/// Bumped whenever the built-in base type, its hooks or the host modules change shape.
/// Units built against another version are refused.
pub const HOST_ABI_VERSION: u32 = 1;

/// Where a lowered function came from. Rhai reports positions inside the lowered snippet
/// (`fn name(params) {` followed by the captured body); this maps them back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionOrigin {
    pub path: PathBuf,
    pub decl_line: usize,
    pub decl_column: usize,
    pub body_line: usize,
    pub body_column: usize,
    pub header_len: usize,
}

impl FunctionOrigin {
    pub fn declaration(&self) -> SourceLocation {
        SourceLocation::new(&self.path, self.decl_line, self.decl_column)
    }

    pub fn map(&self, position: Position) -> SourceLocation {
        let (Some(line), column) = (position.line(), position.position()) else {
            return self.declaration();
        };
        let column = column.unwrap_or(1);
        if line <= 1 {
            let offset = column.saturating_sub(self.header_len + 1);
            SourceLocation::new(&self.path, self.body_line, self.body_column + offset)
        } else {
            SourceLocation::new(&self.path, self.body_line + line - 1, column)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolEntry {
    /// `None` for module-level helper functions.
    pub type_name: Option<String>,
    pub function: String,
    pub arity: usize,
    pub origin: FunctionOrigin,
}

/// Sidecar written next to an exported unit so tools can map functions back to source.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugSymbols {
    pub abi_version: u32,
    pub unit_id: String,
    pub corpus_hash: String,
    pub entries: Vec<SymbolEntry>,
}

impl DebugSymbols {
    pub fn lookup(&self, type_name: Option<&str>, function: &str) -> Option<&SymbolEntry> {
        self.entries.iter().find(|entry| entry.type_name.as_deref() == type_name && entry.function == function)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("serialize debug symbols")
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("parse debug symbols")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionImage {
    pub name: String,
    pub params: Vec<String>,
    pub lowered: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldImage {
    pub name: String,
    pub kind: String,
    pub public: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypeImage {
    pub name: String,
    pub base: Option<String>,
    pub is_abstract: bool,
    pub path: PathBuf,
    pub fields: Vec<FieldImage>,
    pub methods: Vec<FunctionImage>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModuleImage {
    pub path: PathBuf,
    pub functions: Vec<FunctionImage>,
}

/// Executable form of a unit: every lowered function plus the declarations needed to
/// rebuild the type table, encoded with bincode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnitImage {
    pub abi_version: u32,
    pub unit_id: String,
    pub corpus_hash: String,
    pub modules: Vec<ModuleImage>,
    pub types: Vec<TypeImage>,
}

impl UnitImage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("encode unit image")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let image: UnitImage = bincode::deserialize(bytes).context("decode unit image")?;
        if image.abi_version != HOST_ABI_VERSION {
            return Err(anyhow!(
                "unit {} was built for host ABI {} but this host is ABI {}",
                image.unit_id,
                image.abi_version,
                HOST_ABI_VERSION
            ));
        }
        Ok(image)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("read unit image {}", path.display()))?;
        Self::decode(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> FunctionOrigin {
        FunctionOrigin {
            path: PathBuf::from("spin.ks"),
            decl_line: 4,
            decl_column: 8,
            body_line: 4,
            body_column: 24,
            header_len: 19,
        }
    }

    #[test]
    fn first_line_positions_are_shifted_past_the_header() {
        let location = origin().map(Position::new(1, 25));
        assert_eq!((location.line, location.column), (4, 29));
    }

    #[test]
    fn later_lines_keep_their_column() {
        let location = origin().map(Position::new(3, 9));
        assert_eq!((location.line, location.column), (6, 9));
        assert_eq!(origin().map(Position::NONE), origin().declaration());
    }

    #[test]
    fn images_from_another_abi_are_refused() {
        let image = UnitImage {
            abi_version: HOST_ABI_VERSION + 1,
            unit_id: "u".into(),
            corpus_hash: "h".into(),
            modules: Vec::new(),
            types: Vec::new(),
        };
        let bytes = image.encode().expect("encode");
        let err = UnitImage::decode(&bytes).expect_err("abi mismatch");
        assert!(err.to_string().contains("host ABI"));
    }
}
