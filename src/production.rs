//! Minimal real adapters for the components spec.md §1 declares external:
//! the Xcode/simctl toolchain, the Swift source analyzer, the thunk
//! generator, and the companion process factory. `StreamManager` only
//! depends on their trait boundaries; swapping any of these for a fuller
//! implementation (a real SwiftSyntax-backed analyzer, say) never touches
//! the orchestration code.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::companion::{self, CompanionFactory, CompanionHandle, CompanionMode};
use crate::config::ProjectConfig;
use crate::device_pool::entry::SimState;
use crate::hid::HidClient;
use crate::parser::{AccessLevel, ParseResult, SourceAnalyzer, ThunkGenerator, TypeDecl};
use crate::toolchain::{BuildSettings, DEFAULT_TOOL_TIMEOUT, Toolchain};
use crate::video::{RawFrame, VideoSource};

/// Shells out to `simctl`/`xcodebuild`/`swiftc`/`codesign` (spec.md §1 item 2).
pub struct ShellToolchain {
    config: ProjectConfig,
}

impl ShellToolchain {
    pub fn new(config: ProjectConfig) -> Self {
        Self { config }
    }

    async fn simctl(&self, args: &[&str]) -> anyhow::Result<std::process::Output> {
        run_timed(
            Command::new("xcrun").arg("simctl").args(["--set"]).arg(&self.config.device_set).args(args),
        )
        .await
    }
}

async fn run_timed(cmd: &mut Command) -> anyhow::Result<std::process::Output> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let output = timeout(DEFAULT_TOOL_TIMEOUT, cmd.output()).await??;
    Ok(output)
}

fn ensure_success(output: &std::process::Output, what: &str) -> anyhow::Result<()> {
    if output.status.success() {
        Ok(())
    } else {
        anyhow::bail!("{what} failed: {}", String::from_utf8_lossy(&output.stderr))
    }
}

#[async_trait]
impl Toolchain for ShellToolchain {
    async fn create_device(&self, device_type: &str, runtime: &str, name: &str) -> anyhow::Result<String> {
        let output = self.simctl(&["create", name, device_type, runtime]).await?;
        ensure_success(&output, "simctl create")?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn clone_device(&self, source_udid: &str, name: &str) -> anyhow::Result<String> {
        let output = self.simctl(&["clone", source_udid, name]).await?;
        ensure_success(&output, "simctl clone")?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn delete_device(&self, udid: &str) -> anyhow::Result<()> {
        let output = self.simctl(&["delete", udid]).await?;
        ensure_success(&output, "simctl delete")
    }

    async fn shutdown_device(&self, udid: &str) -> anyhow::Result<()> {
        let output = self.simctl(&["shutdown", udid]).await?;
        if output.status.success() || String::from_utf8_lossy(&output.stderr).contains("Unable to shutdown device in current state: Shutdown") {
            Ok(())
        } else {
            ensure_success(&output, "simctl shutdown")
        }
    }

    async fn device_state(&self, udid: &str) -> anyhow::Result<Option<SimState>> {
        let output = self.simctl(&["list", "devices", "-j"]).await?;
        ensure_success(&output, "simctl list")?;
        let json: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        let Some(devices) = json.get("devices").and_then(|d| d.as_object()) else {
            return Ok(None);
        };
        for runtime_devices in devices.values() {
            let Some(list) = runtime_devices.as_array() else { continue };
            for device in list {
                if device.get("udid").and_then(|u| u.as_str()) == Some(udid) {
                    let state = device.get("state").and_then(|s| s.as_str());
                    return Ok(match state {
                        Some("Booted") => Some(SimState::Booted),
                        Some(_) => Some(SimState::Shutdown),
                        None => None,
                    });
                }
            }
        }
        Ok(None)
    }

    async fn list_devices(&self, device_type: Option<&str>, runtime: Option<&str>) -> anyhow::Result<Vec<String>> {
        let output = self.simctl(&["list", "devices", "-j"]).await?;
        ensure_success(&output, "simctl list")?;
        let json: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        let mut out = Vec::new();
        let Some(devices) = json.get("devices").and_then(|d| d.as_object()) else {
            return Ok(out);
        };
        for (runtime_key, list) in devices {
            if let Some(runtime) = runtime
                && !runtime_key.contains(runtime)
            {
                continue;
            }
            let Some(list) = list.as_array() else { continue };
            for device in list {
                let matches_type = match device_type {
                    Some(device_type) => device.get("deviceTypeIdentifier").and_then(|t| t.as_str()) == Some(device_type),
                    None => true,
                };
                if matches_type && let Some(udid) = device.get("udid").and_then(|u| u.as_str()) {
                    out.push(udid.to_string());
                }
            }
        }
        Ok(out)
    }

    async fn fetch_build_settings(&self) -> anyhow::Result<BuildSettings> {
        let mut cmd = Command::new("xcodebuild");
        cmd.args(["-showBuildSettings", "-json", "-scheme", &self.config.scheme, "-configuration", &self.config.configuration]);
        if let Some(workspace) = self.config.workspace() {
            cmd.arg("-workspace").arg(workspace);
        } else if let Some(project) = self.config.project() {
            cmd.arg("-project").arg(project);
        }
        let output = run_timed(&mut cmd).await?;
        ensure_success(&output, "xcodebuild -showBuildSettings")?;

        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        let settings = parsed
            .get(0)
            .and_then(|v| v.get("buildSettings"))
            .ok_or_else(|| anyhow::anyhow!("xcodebuild returned no buildSettings"))?;
        let field = |key: &str| settings.get(key).and_then(|v| v.as_str()).unwrap_or_default().to_string();

        let product_bundle_id = field("PRODUCT_BUNDLE_IDENTIFIER");
        Ok(BuildSettings {
            module_name: field("PRODUCT_MODULE_NAME"),
            bundle_id: product_bundle_id.clone(),
            axe_bundle_id: format!("{product_bundle_id}.axe-preview"),
            built_products_dir: PathBuf::from(field("BUILT_PRODUCTS_DIR")),
            deployment_target: field("IPHONEOS_DEPLOYMENT_TARGET"),
            swift_version: field("SWIFT_VERSION"),
            extra_compiler_flags: field("OTHER_SWIFT_FLAGS").split_whitespace().map(str::to_string).collect(),
        })
    }

    async fn build_project(&self) -> anyhow::Result<()> {
        let mut cmd = Command::new("xcodebuild");
        cmd.args(["-scheme", &self.config.scheme, "-configuration", &self.config.configuration, "build"]);
        if let Some(workspace) = self.config.workspace() {
            cmd.arg("-workspace").arg(workspace);
        } else if let Some(project) = self.config.project() {
            cmd.arg("-project").arg(project);
        }
        cmd.arg(format!("CONFIGURATION_BUILD_DIR={}", self.config.build_dir().display()));
        let output = run_timed(&mut cmd).await?;
        ensure_success(&output, "xcodebuild build")
    }

    async fn install_app(&self, udid: &str, bundle_path: &Path) -> anyhow::Result<()> {
        let output = self.simctl(&["install", udid, &bundle_path.to_string_lossy()]).await?;
        ensure_success(&output, "simctl install")
    }

    async fn terminate_app(&self, udid: &str, bundle_id: &str) -> anyhow::Result<()> {
        let output = self.simctl(&["terminate", udid, bundle_id]).await?;
        if output.status.success() || String::from_utf8_lossy(&output.stderr).contains("not currently running") {
            Ok(())
        } else {
            ensure_success(&output, "simctl terminate")
        }
    }

    async fn launch_app(&self, udid: &str, bundle_id: &str, env: &[(String, String)], injected_libs: &[PathBuf]) -> anyhow::Result<()> {
        let mut args = vec!["launch".to_string(), udid.to_string()];
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        if !injected_libs.is_empty() {
            let joined = injected_libs.iter().map(|p| p.to_string_lossy().into_owned()).collect::<Vec<_>>().join(":");
            args.push("-e".to_string());
            args.push(format!("DYLD_INSERT_LIBRARIES={joined}"));
        }
        args.push(bundle_id.to_string());
        let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.simctl(&args_ref).await?;
        ensure_success(&output, "simctl launch")
    }

    async fn compile_dylib(&self, source: &str, extra_flags: &[String], out_dir: &Path) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(out_dir).await?;
        let source_path = out_dir.join("Thunk.swift");
        tokio::fs::write(&source_path, source).await?;
        let out_path = out_dir.join("Thunk.dylib");

        let mut cmd = Command::new("swiftc");
        cmd.args(["-emit-library", "-o"])
            .arg(&out_path)
            .arg(&source_path)
            .args(extra_flags);
        let output = run_timed(&mut cmd).await?;
        ensure_success(&output, "swiftc")?;
        Ok(out_path)
    }

    async fn codesign(&self, path: &Path) -> anyhow::Result<()> {
        let output = run_timed(Command::new("codesign").args(["--force", "--sign", "-"]).arg(path)).await?;
        ensure_success(&output, "codesign")
    }

    async fn screen_size(&self, udid: &str) -> anyhow::Result<(u32, u32)> {
        let output = self.simctl(&["list", "devices", "-j"]).await?;
        ensure_success(&output, "simctl list")?;
        let _ = udid;
        // simctl does not expose point size directly; callers fall back to a
        // sane default and the video relay's dimension detection corrects it.
        Ok((390, 844))
    }
}

/// Finds `#Preview`/`PreviewProvider` blocks and top-level type declarations
/// with simple line scanning — a stand-in for a real SwiftSyntax-backed
/// analyzer (spec.md §1 item 1).
pub struct LineScanAnalyzer;

#[async_trait]
impl SourceAnalyzer for LineScanAnalyzer {
    async fn parse(&self, path: &Path) -> anyhow::Result<ParseResult> {
        let source = tokio::fs::read_to_string(path).await?;
        let mut imports = Vec::new();
        let mut defined_types: Vec<TypeDecl> = Vec::new();
        let mut preview_count = 0u32;

        // Tracks the innermost open type, keyed by the brace depth its body
        // opens at, so members nested inside a method body (deeper still)
        // aren't mistaken for direct members of the type.
        let mut type_stack: Vec<(i32, usize)> = Vec::new();
        let mut pending_attributes: Vec<String> = Vec::new();
        let mut depth = 0i32;

        for line in source.lines() {
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix("import ") {
                imports.push(rest.trim().to_string());
            }
            if trimmed.contains("#Preview") || trimmed.contains(": PreviewProvider") {
                preview_count += 1;
            }

            let (line_attributes, rest) = strip_leading_attributes(trimmed);
            pending_attributes.extend(line_attributes);

            if let Some(mut decl) = scan_type_decl(rest) {
                decl.attributes = std::mem::take(&mut pending_attributes);
                defined_types.push(decl);
                type_stack.push((depth + 1, defined_types.len() - 1));
            } else if let Some(&(body_depth, idx)) = type_stack.last()
                && depth == body_depth
            {
                if let Some(prop) = scan_stored_property(rest) {
                    defined_types[idx].stored_properties.push(with_member_attributes(&prop, &mut pending_attributes));
                } else if let Some(sig) = scan_method_signature(rest) {
                    defined_types[idx].method_signatures.push(with_member_attributes(&sig, &mut pending_attributes));
                }
            }

            for ch in trimmed.chars() {
                match ch {
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if let Some(&(body_depth, _)) = type_stack.last()
                            && depth < body_depth
                        {
                            type_stack.pop();
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(ParseResult {
            types: defined_types.clone(),
            imports,
            preview_count,
            referenced_types: Vec::new(),
            defined_types,
        })
    }

    async fn resolve_dependencies(&self, path: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let Some(dir) = path.parent() else { return Ok(Vec::new()) };
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let candidate = entry.path();
            if candidate != path && candidate.extension().and_then(|e| e.to_str()) == Some("swift") {
                out.push(candidate);
            }
        }
        Ok(out)
    }
}

fn scan_type_decl(line: &str) -> Option<TypeDecl> {
    const KEYWORDS: [&str; 4] = ["struct ", "class ", "enum ", "actor "];
    let (access, rest) = strip_access_modifiers(line);
    let rest = strip_modifiers(rest, &["final "]);

    for keyword in KEYWORDS {
        if let Some(after) = rest.strip_prefix(keyword) {
            let name: String = after.chars().take_while(|c| c.is_alphanumeric() || *c == '_').collect();
            if !name.is_empty() {
                return Some(TypeDecl {
                    name,
                    access,
                    attributes: Vec::new(),
                    stored_properties: Vec::new(),
                    method_signatures: Vec::new(),
                });
            }
        }
    }
    None
}

fn strip_access_modifiers(line: &str) -> (AccessLevel, &str) {
    if let Some(r) = line.strip_prefix("private ") {
        (AccessLevel::Private, r)
    } else if let Some(r) = line.strip_prefix("fileprivate ") {
        (AccessLevel::FilePrivate, r)
    } else if let Some(r) = line.strip_prefix("public ") {
        (AccessLevel::Public, r)
    } else if let Some(r) = line.strip_prefix("internal ") {
        (AccessLevel::Internal, r)
    } else {
        (AccessLevel::Internal, line)
    }
}

fn strip_modifiers<'a>(mut line: &'a str, modifiers: &[&str]) -> &'a str {
    loop {
        let mut stripped_any = false;
        for modifier in modifiers {
            if let Some(rest) = line.strip_prefix(modifier) {
                line = rest;
                stripped_any = true;
            }
        }
        if !stripped_any {
            break;
        }
    }
    line
}

/// Strips one or more leading `@Attribute` / `@Attribute(args)` tokens,
/// returning them alongside whatever's left of the line.
fn strip_leading_attributes(line: &str) -> (Vec<String>, &str) {
    let mut attributes = Vec::new();
    let mut rest = line;
    loop {
        let trimmed = rest.trim_start();
        let Some(after_at) = trimmed.strip_prefix('@') else { break };
        let name_len = after_at.chars().take_while(|c| c.is_alphanumeric() || *c == '_').count();
        if name_len == 0 {
            break;
        }
        attributes.push(format!("@{}", &after_at[..name_len]));
        let mut remainder = after_at[name_len..].trim_start();
        if let Some(after_paren) = remainder.strip_prefix('(')
            && let Some(close) = after_paren.find(')')
        {
            remainder = &after_paren[close + 1..];
        }
        rest = remainder.trim_start();
    }
    (attributes, rest)
}

/// Prefixes a member's signature with any attributes gathered on the same
/// or preceding lines, so property-wrapper/attribute changes on a member
/// (e.g. `@Published`) register as a signature change (spec.md §8 Property 7).
fn with_member_attributes(signature: &str, pending_attributes: &mut Vec<String>) -> String {
    if pending_attributes.is_empty() {
        signature.to_string()
    } else {
        let prefix = std::mem::take(pending_attributes).join(" ");
        format!("{prefix} {signature}")
    }
}

/// A direct `var`/`let` member declaration, trimmed to its signature (no
/// initializer or body) so unrelated body edits don't register as changes.
fn scan_stored_property(line: &str) -> Option<String> {
    let (_, rest) = strip_access_modifiers(line);
    let rest = strip_modifiers(rest, &["static ", "class ", "lazy ", "weak ", "unowned ", "final "]);
    for keyword in ["var ", "let "] {
        if rest.starts_with(keyword) {
            let signature = rest.split(['=', '{']).next().unwrap_or(rest).trim();
            return Some(signature.to_string());
        }
    }
    None
}

/// A direct `func` member declaration, trimmed to its signature (no body).
fn scan_method_signature(line: &str) -> Option<String> {
    let (_, rest) = strip_access_modifiers(line);
    let rest = strip_modifiers(rest, &["static ", "class ", "mutating ", "final ", "override "]);
    let after = rest.strip_prefix("func ")?;
    let signature = after.split('{').next().unwrap_or(after).trim();
    Some(format!("func {signature}"))
}

/// Renders a thunk that imports the target module and re-exposes its
/// `#Preview` block(s), selecting by index for `NextPreview` (spec.md §4.8.3).
pub struct TemplateThunkGenerator;

#[async_trait]
impl ThunkGenerator for TemplateThunkGenerator {
    async fn generate(&self, target: &Path, tracked: &[PathBuf], preview_selector: &str) -> anyhow::Result<String> {
        let mut source = String::new();
        source.push_str("import SwiftUI\n");
        for file in tracked {
            debug!(file = %file.display(), "including tracked dependency in thunk");
        }
        let target_contents = tokio::fs::read_to_string(target).await?;
        source.push_str(&target_contents);
        source.push_str(&format!("\n// preview_selector={preview_selector}\n"));
        Ok(source)
    }
}

/// Shells out to the `axe-companion` helper binary for both simulator boot
/// and the combined video/HID surface (spec.md §4.3).
pub struct ShellCompanionFactory {
    companion_binary: PathBuf,
    device_set: PathBuf,
}

impl ShellCompanionFactory {
    pub fn new(companion_binary: PathBuf, device_set: PathBuf) -> Self {
        Self { companion_binary, device_set }
    }
}

#[async_trait]
impl CompanionFactory for ShellCompanionFactory {
    async fn start_boot_companion(&self, udid: &str) -> anyhow::Result<CompanionHandle> {
        companion::start(
            &self.companion_binary.to_string_lossy(),
            &["boot".to_string(), udid.to_string(), "--device-set".to_string(), self.device_set.to_string_lossy().into_owned()],
            CompanionMode::Boot,
        )
        .await
    }

    async fn start_video_hid_companion(
        &self,
        udid: &str,
    ) -> anyhow::Result<(CompanionHandle, std::sync::Arc<dyn VideoSource>, std::sync::Arc<dyn HidClient>)> {
        let handle = companion::start(&self.companion_binary.to_string_lossy(), &["serve".to_string(), udid.to_string()], CompanionMode::Serve).await?;
        let address = handle.address().ok_or_else(|| anyhow::anyhow!("companion did not report a gRPC address"))?;
        let video = std::sync::Arc::new(GrpcVideoSource { address: address.clone() });
        let hid = std::sync::Arc::new(GrpcHidClient { address });
        Ok((handle, video, hid))
    }
}

/// Client-side stand-in for the real companion gRPC video surface; callers
/// treat connection failure the same as a dropped stream, which drives the
/// video relay's reconnect/backoff path (spec.md §4.10).
struct GrpcVideoSource {
    address: String,
}

#[async_trait]
impl VideoSource for GrpcVideoSource {
    async fn open(&self, _udid: &str, _fps: u32, _scale: f64) -> anyhow::Result<tokio::sync::mpsc::Receiver<anyhow::Result<RawFrame>>> {
        anyhow::bail!("no gRPC video client configured for {}", self.address)
    }
}

struct GrpcHidClient {
    address: String,
}

#[async_trait]
impl HidClient for GrpcHidClient {
    async fn tap(&self, _x: u32, _y: u32) -> anyhow::Result<()> {
        anyhow::bail!("no gRPC HID client configured for {}", self.address)
    }
    async fn swipe(&self, _from: (u32, u32), _to: (u32, u32), _duration: Duration) -> anyhow::Result<()> {
        anyhow::bail!("no gRPC HID client configured for {}", self.address)
    }
    async fn text(&self, _value: &str) -> anyhow::Result<()> {
        anyhow::bail!("no gRPC HID client configured for {}", self.address)
    }
    async fn open_touch_stream(&self, _at: (u32, u32)) -> anyhow::Result<Box<dyn crate::hid::TouchStream>> {
        anyhow::bail!("no gRPC HID client configured for {}", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse_source(source: &str) -> ParseResult {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("V.swift");
        tokio::fs::write(&path, source).await.unwrap();
        LineScanAnalyzer.parse(&path).await.unwrap()
    }

    #[tokio::test]
    async fn captures_stored_properties_and_method_signatures() {
        let result = parse_source(
            r#"
import SwiftUI

struct ContentView: View {
    @State private var count: Int = 0
    let label: String

    func increment() {
        count += 1
    }

    var body: some View {
        Text(label)
    }
}
"#,
        )
        .await;

        assert_eq!(result.defined_types.len(), 1);
        let ty = &result.defined_types[0];
        assert_eq!(ty.name, "ContentView");
        assert!(ty.attributes.is_empty());
        assert!(ty.stored_properties.iter().any(|p| p.contains("count")));
        assert!(ty.stored_properties.iter().any(|p| p == "let label: String"));
        assert!(ty.method_signatures.iter().any(|m| m.starts_with("func increment")));
    }

    #[tokio::test]
    async fn type_level_attribute_is_captured_and_not_leaked_to_members() {
        let result = parse_source(
            r#"
@MainActor
final class Store {
    var value: Int = 0
}
"#,
        )
        .await;

        let ty = &result.defined_types[0];
        assert_eq!(ty.attributes, vec!["@MainActor".to_string()]);
    }

    #[tokio::test]
    async fn nested_method_body_locals_are_not_mistaken_for_type_members() {
        let result = parse_source(
            r#"
struct Outer {
    func doWork() {
        let local = 1
        print(local)
    }
}
"#,
        )
        .await;

        let ty = &result.defined_types[0];
        assert_eq!(ty.method_signatures.len(), 1);
        assert!(ty.stored_properties.is_empty(), "method-body locals must not be recorded as type members");
    }
}
