//! Trait boundary for the out-of-scope Swift parser and thunk generator
//! (spec.md §1, item 1): `parse(path) -> {types, imports, previews,
//! skeletonHash, referencedTypes, definedTypes}` plus a template engine.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    Public,
    Internal,
    Private,
    FilePrivate,
}

#[derive(Debug, Clone)]
pub struct TypeDecl {
    pub name: String,
    pub access: AccessLevel,
    /// Attached attributes (`@State`, `@MainActor`, ...), in source order.
    pub attributes: Vec<String>,
    /// Direct stored-property declarations (e.g. `"var count: Int"`).
    pub stored_properties: Vec<String>,
    /// Direct method signatures (e.g. `"func reload(_ x: Int)"`).
    pub method_signatures: Vec<String>,
}

/// The pure result of parsing one Swift source file.
#[derive(Debug, Clone, Default)]
pub struct ParseResult {
    pub types: Vec<TypeDecl>,
    pub imports: Vec<String>,
    pub preview_count: u32,
    /// Names of other files this file's previews depend on, already
    /// resolved to clean paths by the analyzer.
    pub referenced_types: Vec<String>,
    pub defined_types: Vec<TypeDecl>,
}

#[async_trait]
pub trait SourceAnalyzer: Send + Sync {
    async fn parse(&self, path: &Path) -> anyhow::Result<ParseResult>;

    /// Resolve the one-level dependency files for `path`'s previews.
    async fn resolve_dependencies(&self, path: &Path) -> anyhow::Result<Vec<PathBuf>>;
}

#[async_trait]
pub trait ThunkGenerator: Send + Sync {
    /// Render the combined thunk source for the target file plus its
    /// (collision-filtered) tracked dependency files.
    async fn generate(&self, target: &Path, tracked: &[PathBuf], preview_selector: &str) -> anyhow::Result<String>;
}
