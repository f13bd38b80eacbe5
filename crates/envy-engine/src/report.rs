//! Enriched failure reports
//!
//! Scripting-runtime errors arrive as flat strings. The report builder
//! turns one into a block a user can act on: the headline, a cleaned stack
//! trace, the spec file and line when the headline carries one, the phase,
//! and the provenance chain walked through cfg parents so nested
//! declarations point back at the manifest that introduced them.

use envy_cfg::{CfgPool, PackageCfg};
use envy_key::CanonicalKey;
use envy_phases::Phase;
use std::fmt::Write as _;
use std::sync::Arc;

/// Spec-file location parsed from an error headline of the form
/// `path/name.lua:LINE: message`.
#[must_use]
pub fn parse_spec_location(headline: &str) -> Option<(String, u32)> {
    let marker = headline.find(".lua:")?;
    let file_end = marker + ".lua".len();

    // Walk backwards to the start of the path token.
    let file_start = headline[..marker]
        .rfind(|c: char| c.is_whitespace() || c == '"' || c == '\'' || c == '(')
        .map_or(0, |pos| pos + 1);

    let rest = &headline[file_end + 1..];
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() || !rest[digits.len()..].starts_with(':') {
        return None;
    }

    let line = digits.parse().ok()?;
    Some((headline[file_start..file_end].to_string(), line))
}

/// True for stack lines that carry no user-actionable location: native
/// frames (`[C]: ...`) and chunks loaded from strings (`[string "..."]`).
fn is_noise_frame(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("[C]") || trimmed.starts_with("[string ")
}

/// Build the multi-line failure block for one package.
#[must_use]
pub fn format_failure(
    key: &CanonicalKey,
    phase: Phase,
    error_text: &str,
    cfg: &Arc<PackageCfg>,
    pool: &CfgPool,
) -> String {
    let mut lines = error_text.lines();
    let headline = lines.next().unwrap_or("unknown error").trim();

    let mut out = String::new();
    let _ = writeln!(out, "error: {headline}");
    let _ = writeln!(out, "  package: {key}");
    let _ = writeln!(out, "  phase: {phase}");

    if let Some((file, line)) = parse_spec_location(headline) {
        let _ = writeln!(out, "  spec file: {file}:{line}");
    }
    let _ = writeln!(out, "  declared in: {}", cfg.declaring_file_path);

    let stack: Vec<&str> = lines
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !is_noise_frame(line))
        .collect();
    if !stack.is_empty() {
        let _ = writeln!(out, "  stack:");
        for frame in stack {
            let _ = writeln!(out, "    {}", frame.trim());
        }
    }

    let chain = provenance_chain(cfg, pool);
    if chain.len() > 1 {
        let _ = writeln!(out, "  required by:");
        for (identity, declared_in) in chain.iter().skip(1) {
            let _ = writeln!(out, "    {identity} ({declared_in})");
        }
    }

    out
}

/// Walk the parent pointers from `cfg` to the root declaration. Each step
/// is `(identity, declaring-file basename)`, starting at `cfg` itself.
fn provenance_chain(cfg: &Arc<PackageCfg>, pool: &CfgPool) -> Vec<(String, String)> {
    let mut chain = Vec::new();
    let mut cursor = Some(Arc::clone(cfg));
    while let Some(current) = cursor {
        let basename = current
            .declaring_file_path
            .file_name()
            .unwrap_or(current.declaring_file_path.as_str())
            .to_string();
        chain.push((current.identity.clone(), basename));
        cursor = current.parent.and_then(|id| pool.get(id));
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use envy_cfg::PackageSource;

    fn pooled_chain() -> (CfgPool, Arc<PackageCfg>) {
        let pool = CfgPool::new();
        let (root_id, _) = pool.emplace(PackageCfg {
            identity: "proj.app@1".to_string(),
            source: PackageSource::WeakRef,
            serialized_options: "{}".to_string(),
            needed_by: None,
            parent: None,
            weak: None,
            product: None,
            declaring_file_path: Utf8PathBuf::from("/work/manifest.lua"),
        });
        let (_, leaf) = pool.emplace(PackageCfg {
            identity: "zlib.ng@2".to_string(),
            source: PackageSource::WeakRef,
            serialized_options: "{}".to_string(),
            needed_by: None,
            parent: Some(root_id),
            weak: None,
            product: None,
            declaring_file_path: Utf8PathBuf::from("/cache/recipes/zlib.ng@2.lua"),
        });
        (pool, leaf)
    }

    #[test]
    fn spec_locations_parse_from_headlines() {
        assert_eq!(
            parse_spec_location("recipes/zlib.lua:42: attempt to index a nil value"),
            Some(("recipes/zlib.lua".to_string(), 42))
        );
        assert_eq!(parse_spec_location("no location here"), None);
        assert_eq!(parse_spec_location("zlib.lua:xx: bad line"), None);
    }

    #[test]
    fn report_contains_every_section() {
        let (pool, cfg) = pooled_chain();
        let key = CanonicalKey::parse("zlib.ng@2").unwrap();
        let error_text = "zlib.ng@2.lua:7: bad cflags\n\
                          stack traceback:\n\
                          \t[C]: in function 'error'\n\
                          \tzlib.ng@2.lua:7: in main chunk\n\
                          \t[string \"loader\"]: in ?";

        let block = format_failure(&key, Phase::Build, error_text, &cfg, &pool);

        assert!(block.starts_with("error: zlib.ng@2.lua:7: bad cflags"));
        assert!(block.contains("package: zlib.ng@2"));
        assert!(block.contains("phase: build"));
        assert!(block.contains("spec file: zlib.ng@2.lua:7"));
        assert!(block.contains("declared in: /cache/recipes/zlib.ng@2.lua"));
        assert!(block.contains("zlib.ng@2.lua:7: in main chunk"));
        assert!(block.contains("required by:"));
        assert!(block.contains("proj.app@1 (manifest.lua)"));
        // Native and string-chunk frames are dropped.
        assert!(!block.contains("[C]"));
        assert!(!block.contains("[string"));
    }

    #[test]
    fn root_packages_have_no_required_by_section() {
        let pool = CfgPool::new();
        let (_, cfg) = pool.emplace(PackageCfg {
            identity: "proj.app@1".to_string(),
            source: PackageSource::WeakRef,
            serialized_options: "{}".to_string(),
            needed_by: None,
            parent: None,
            weak: None,
            product: None,
            declaring_file_path: Utf8PathBuf::from("/work/manifest.lua"),
        });
        let key = CanonicalKey::parse("proj.app@1").unwrap();

        let block = format_failure(&key, Phase::Fetch, "plain failure", &cfg, &pool);
        assert!(!block.contains("required by:"));
    }
}
