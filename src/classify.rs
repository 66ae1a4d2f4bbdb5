//! Skeleton hashing and change classification (spec.md §4.6).
//!
//! The structural digest elides bodies but keeps signatures, attributes,
//! stored-property declarations, imports, and member order — computed here
//! via [`crate::parser::SourceAnalyzer`] output rather than re-parsing, since
//! the parser is an injected external collaborator (spec.md §1).

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::parser::{ParseResult, SourceAnalyzer};

pub type SkeletonHash = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    HotReload,
    Rebuild,
}

/// A fixed sentinel stands in for every elided body so skeletons of
/// identical shape hash identically regardless of body length.
const BODY_SENTINEL: &str = "<body>";

pub fn skeleton_hash_from_parse(parse: &ParseResult) -> SkeletonHash {
    let mut hasher = Sha256::new();
    for import in &parse.imports {
        hasher.update(b"import:");
        hasher.update(import.as_bytes());
        hasher.update(b"\n");
    }
    for ty in &parse.defined_types {
        hasher.update(b"type:");
        hasher.update(ty.name.as_bytes());
        hasher.update(format!(":{:?}:", ty.access).as_bytes());
        for attr in &ty.attributes {
            hasher.update(b"attr:");
            hasher.update(attr.as_bytes());
            hasher.update(b",");
        }
        for prop in &ty.stored_properties {
            hasher.update(b"prop:");
            hasher.update(prop.as_bytes());
            hasher.update(b",");
        }
        for sig in &ty.method_signatures {
            hasher.update(b"method:");
            hasher.update(sig.as_bytes());
            hasher.update(b",");
        }
        hasher.update(BODY_SENTINEL.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(format!("previews:{}:", parse.preview_count).as_bytes());
    hasher.update(BODY_SENTINEL.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Compute the skeleton hash for a file by re-running the analyzer.
pub async fn skeleton_hash(analyzer: &dyn SourceAnalyzer, path: &Path) -> Option<SkeletonHash> {
    let parse = analyzer.parse(path).await.ok()?;
    Some(skeleton_hash_from_parse(&parse))
}

/// `classifyChange(path, prevHash)` (spec.md §4.6).
pub async fn classify_change(
    analyzer: &dyn SourceAnalyzer,
    path: &Path,
    prev_hash: Option<&str>,
) -> (Classification, SkeletonHash) {
    match skeleton_hash(analyzer, path).await {
        Some(new_hash) => {
            if Some(new_hash.as_str()) == prev_hash {
                (Classification::HotReload, new_hash)
            } else {
                (Classification::Rebuild, new_hash)
            }
        }
        None => (Classification::Rebuild, String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{AccessLevel, TypeDecl};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct FakeAnalyzer {
        result: Mutex<ParseResult>,
    }

    #[async_trait]
    impl SourceAnalyzer for FakeAnalyzer {
        async fn parse(&self, _path: &Path) -> anyhow::Result<ParseResult> {
            Ok(self.result.lock().unwrap().clone())
        }
        async fn resolve_dependencies(&self, _path: &Path) -> anyhow::Result<Vec<PathBuf>> {
            Ok(vec![])
        }
    }

    fn parse_with(type_count: usize) -> ParseResult {
        ParseResult {
            types: vec![],
            imports: vec!["SwiftUI".into()],
            preview_count: 1,
            referenced_types: vec![],
            defined_types: (0..type_count)
                .map(|i| TypeDecl {
                    name: format!("T{i}"),
                    access: AccessLevel::Internal,
                    attributes: vec![],
                    stored_properties: vec![],
                    method_signatures: vec![],
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn body_only_edits_leave_hash_unchanged() {
        let analyzer = FakeAnalyzer {
            result: Mutex::new(parse_with(1)),
        };
        let path = PathBuf::from("/p/V.swift");
        let h1 = skeleton_hash(&analyzer, &path).await.unwrap();
        // Re-parsing the identical skeleton (bodies are never part of
        // ParseResult) should reproduce the same hash.
        let h2 = skeleton_hash(&analyzer, &path).await.unwrap();
        assert_eq!(h1, h2);
    }

    #[tokio::test]
    async fn new_type_changes_hash() {
        let analyzer = FakeAnalyzer {
            result: Mutex::new(parse_with(1)),
        };
        let path = PathBuf::from("/p/V.swift");
        let h1 = skeleton_hash(&analyzer, &path).await.unwrap();
        *analyzer.result.lock().unwrap() = parse_with(2);
        let h2 = skeleton_hash(&analyzer, &path).await.unwrap();
        assert_ne!(h1, h2);
    }

    fn single_type(ty: TypeDecl) -> ParseResult {
        ParseResult {
            types: vec![],
            imports: vec!["SwiftUI".into()],
            preview_count: 1,
            referenced_types: vec![],
            defined_types: vec![ty],
        }
    }

    fn base_type() -> TypeDecl {
        TypeDecl {
            name: "ContentView".into(),
            access: AccessLevel::Internal,
            attributes: vec![],
            stored_properties: vec![],
            method_signatures: vec![],
        }
    }

    #[tokio::test]
    async fn stored_property_change_changes_hash() {
        let analyzer = FakeAnalyzer {
            result: Mutex::new(single_type(base_type())),
        };
        let path = PathBuf::from("/p/V.swift");
        let h1 = skeleton_hash(&analyzer, &path).await.unwrap();

        let mut with_property = base_type();
        with_property.stored_properties.push("var count: Int".to_string());
        *analyzer.result.lock().unwrap() = single_type(with_property);
        let h2 = skeleton_hash(&analyzer, &path).await.unwrap();

        assert_ne!(h1, h2);
    }

    #[tokio::test]
    async fn method_signature_change_changes_hash() {
        let analyzer = FakeAnalyzer {
            result: Mutex::new(single_type(base_type())),
        };
        let path = PathBuf::from("/p/V.swift");
        let h1 = skeleton_hash(&analyzer, &path).await.unwrap();

        let mut with_method = base_type();
        with_method.method_signatures.push("func reload()".to_string());
        *analyzer.result.lock().unwrap() = single_type(with_method);
        let h2 = skeleton_hash(&analyzer, &path).await.unwrap();

        assert_ne!(h1, h2);
    }

    #[tokio::test]
    async fn attribute_change_changes_hash() {
        let analyzer = FakeAnalyzer {
            result: Mutex::new(single_type(base_type())),
        };
        let path = PathBuf::from("/p/V.swift");
        let h1 = skeleton_hash(&analyzer, &path).await.unwrap();

        let mut with_attribute = base_type();
        with_attribute.attributes.push("@MainActor".to_string());
        *analyzer.result.lock().unwrap() = single_type(with_attribute);
        let h2 = skeleton_hash(&analyzer, &path).await.unwrap();

        assert_ne!(h1, h2);
    }

    #[tokio::test]
    async fn classify_matches_hot_reload_when_unchanged() {
        let analyzer = FakeAnalyzer {
            result: Mutex::new(parse_with(1)),
        };
        let path = PathBuf::from("/p/V.swift");
        let prev = skeleton_hash(&analyzer, &path).await.unwrap();
        let (classification, hash) = classify_change(&analyzer, &path, Some(&prev)).await;
        assert_eq!(classification, Classification::HotReload);
        assert_eq!(hash, prev);
    }

    #[tokio::test]
    async fn classify_rebuild_when_hash_differs() {
        let analyzer = FakeAnalyzer {
            result: Mutex::new(parse_with(1)),
        };
        let path = PathBuf::from("/p/V.swift");
        let (classification, _) = classify_change(&analyzer, &path, Some("stale")).await;
        assert_eq!(classification, Classification::Rebuild);
    }
}
