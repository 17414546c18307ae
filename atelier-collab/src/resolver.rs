//! Three-tier conflict resolution for concurrent document edits.
//!
//! Given a common ancestor and two divergent versions of a document, the
//! resolver produces merged content plus a verdict on whether the merge is
//! safe to apply without a human in the loop:
//!
//! ```text
//! (base, local, remote)
//!       │
//!       ▼
//! Tier 1: line-level 3-way merge ── all conflicts ≥ 0.6 confidence? ──► auto
//!       │ no
//!       ▼
//! Tier 2: semantic block merge ──── no same-variable conflicts? ──────► auto
//!       │ no (or no patterns for this file type)
//!       ▼
//! Tier 3: manual — full content wrapped in conflict markers
//! ```
//!
//! The resolver never mutates its inputs and is deterministic for identical
//! inputs aside from the embedded timestamps.
//!
//! Reference: Kleppmann, Chapter 5 — Detecting Concurrent Writes

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Minimum per-conflict confidence for a tier-1 merge to apply automatically.
pub const AUTO_RESOLVE_CONFIDENCE: f32 = 0.6;

/// Input guard: documents beyond this many lines are not merged heuristically.
const MAX_MERGE_LINES: usize = 100_000;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ───────────────────────────────────────────────────────────────────
// Resolution output
// ───────────────────────────────────────────────────────────────────

/// How the resolver arrived at the resolved content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeStrategy {
    /// Remote content taken verbatim (degraded fallback path)
    LastWriteWins,
    /// Line-level 3-way merge
    SmartMerge,
    /// Block-level merge over structural patterns
    SemanticMerge,
    /// A human must pick; content carries conflict markers
    Manual,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::LastWriteWins => "last-write-wins",
            MergeStrategy::SmartMerge => "smart-merge",
            MergeStrategy::SemanticMerge => "semantic-merge",
            MergeStrategy::Manual => "manual",
        }
    }
}

/// Broad classification of what kind of conflict was encountered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    Textual,
    Semantic,
    Structural,
}

/// How risky it is to trust the resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Whether a single conflicted section was resolved by heuristic or deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SectionResolution {
    Auto,
    Manual,
}

/// One conflicted region in the merged output.
///
/// `start`/`end` are line indices into the resolved content (inclusive).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictSection {
    pub start: usize,
    pub end: usize,
    pub local: String,
    pub remote: String,
    pub resolution: SectionResolution,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionMetadata {
    pub kind: ConflictKind,
    pub severity: Severity,
    pub auto_resolved: bool,
    pub user_id: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

/// Full resolver verdict for one base/local/remote triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub strategy: MergeStrategy,
    pub resolved_content: String,
    pub conflicted_sections: Vec<ConflictSection>,
    pub metadata: ResolutionMetadata,
}

impl ConflictResolution {
    /// Degraded fallback: take the incoming remote content verbatim.
    ///
    /// Used when the merge heuristics themselves fail; keeps the session
    /// moving forward instead of wedging on an internal error.
    pub fn last_write_wins(remote: &str, user_id: &str) -> Self {
        Self {
            strategy: MergeStrategy::LastWriteWins,
            resolved_content: remote.to_string(),
            conflicted_sections: Vec::new(),
            metadata: ResolutionMetadata {
                kind: ConflictKind::Textual,
                severity: Severity::Medium,
                auto_resolved: true,
                user_id: user_id.to_string(),
                timestamp: now_ms(),
            },
        }
    }
}

/// Resolver-internal failure. The caller downgrades this to last-write-wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverError {
    /// Input exceeds the line-count guard
    TooLarge { lines: usize },
}

impl std::fmt::Display for ResolverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooLarge { lines } => {
                write!(f, "document too large to merge heuristically: {lines} lines")
            }
        }
    }
}

impl std::error::Error for ResolverError {}

// ───────────────────────────────────────────────────────────────────
// File categories for the semantic tier
// ───────────────────────────────────────────────────────────────────

/// Closed set of file categories with registered block patterns.
///
/// Adding a category forces every `match` over this enum to be revisited,
/// so new kinds of files cannot silently fall through to the wrong matchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileCategory {
    Code,
    StructuredData,
    Markup,
    PlainText,
}

type BlockMatcher = fn(&str) -> Option<String>;

impl FileCategory {
    /// Classify a file by its extension.
    pub fn from_path(path: &str) -> Self {
        let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
        match ext.as_str() {
            "rs" | "ts" | "tsx" | "js" | "jsx" | "py" | "go" | "java" | "c" | "cc" | "cpp"
            | "h" | "hpp" | "cs" | "rb" | "swift" | "kt" | "sh" => FileCategory::Code,
            "json" | "yaml" | "yml" | "toml" | "ini" | "env" => FileCategory::StructuredData,
            "md" | "markdown" | "html" | "htm" | "xml" | "rst" => FileCategory::Markup,
            _ => FileCategory::PlainText,
        }
    }

    /// Ordered matcher list for this category; first match assigns the key.
    ///
    /// An empty list means the semantic tier does not apply.
    fn block_matchers(self) -> &'static [BlockMatcher] {
        match self {
            FileCategory::Code => &[import_key, function_key, assignment_key, comment_key],
            FileCategory::StructuredData => &[mapping_key, list_item_key],
            FileCategory::Markup => &[heading_key, fence_key, list_item_key],
            FileCategory::PlainText => &[],
        }
    }
}

/// Key a matching line by the structural part that survives edits to the
/// rest of the line, so both-sides-changed versions land on the same block.
fn import_key(line: &str) -> Option<String> {
    if is_import(line) {
        let t = line.trim();
        let head: String = t.split(|c: char| c == ';' || c == '(').next().unwrap_or(t).into();
        Some(format!("import:{}", normalize(&head)))
    } else {
        None
    }
}

fn function_key(line: &str) -> Option<String> {
    let t = line.trim_start();
    for kw in ["fn ", "def ", "function ", "func "] {
        if let Some(rest) = t.strip_prefix(kw) {
            let name: String = rest
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            if !name.is_empty() {
                return Some(format!("fn:{name}"));
            }
        }
    }
    None
}

fn assignment_key(line: &str) -> Option<String> {
    parse_assignment(line).map(|(name, _)| format!("decl:{name}"))
}

fn comment_key(line: &str) -> Option<String> {
    if is_comment(line) {
        Some(format!("comment:{}", normalize(line)))
    } else {
        None
    }
}

fn mapping_key(line: &str) -> Option<String> {
    let t = line.trim();
    // "key": value / key: value / key = value
    let sep = t.find(':').or_else(|| t.find('='))?;
    let key = t[..sep].trim().trim_matches('"').trim_matches('\'');
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some(format!("key:{key}"))
}

fn list_item_key(line: &str) -> Option<String> {
    let t = line.trim_start();
    if t.starts_with("- ") || t.starts_with("* ") || t.starts_with("+ ") {
        Some(format!("item:{}", normalize(line)))
    } else {
        None
    }
}

fn heading_key(line: &str) -> Option<String> {
    let t = line.trim_start();
    let level = t.chars().take_while(|c| *c == '#').count();
    if level > 0 && t.chars().nth(level) == Some(' ') {
        Some(format!("heading:{level}"))
    } else {
        None
    }
}

fn fence_key(line: &str) -> Option<String> {
    let t = line.trim_start();
    if t.starts_with("```") || t.starts_with("~~~") {
        Some(format!("fence:{}", normalize(line)))
    } else {
        None
    }
}

fn normalize(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ───────────────────────────────────────────────────────────────────
// Line classification helpers
// ───────────────────────────────────────────────────────────────────

/// Parse `name = value` shapes: plain assignments, declarations with
/// `let`/`const`/`var`/`static` keywords, optional type annotations,
/// dotted member targets. Comparison and arrow operators do not count.
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let mut t = line.trim();
    loop {
        let mut stripped = false;
        for kw in ["pub ", "let ", "const ", "var ", "static ", "mut "] {
            if let Some(rest) = t.strip_prefix(kw) {
                t = rest.trim_start();
                stripped = true;
            }
        }
        if !stripped {
            break;
        }
    }

    let bytes = t.as_bytes();
    let mut eq = None;
    for (i, &b) in bytes.iter().enumerate() {
        if b != b'=' {
            continue;
        }
        let prev = if i > 0 { bytes[i - 1] } else { 0 };
        let next = bytes.get(i + 1).copied().unwrap_or(0);
        if matches!(prev, b'!' | b'<' | b'>' | b'=' | b'+' | b'-' | b'*' | b'/' | b'%' | b'&' | b'|' | b'^') {
            continue;
        }
        if next == b'=' || next == b'>' {
            continue;
        }
        eq = Some(i);
        break;
    }
    let eq = eq?;

    let mut name = t[..eq].trim();
    // Drop a type annotation: `x: u32 = 5`
    if let Some(colon) = name.find(':') {
        name = name[..colon].trim();
    }
    let rhs = t[eq + 1..].trim();
    if name.is_empty() || rhs.is_empty() {
        return None;
    }
    let mut chars = name.chars();
    let first = chars.next()?;
    if !(first.is_alphabetic() || first == '_' || first == '$') {
        return None;
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '$' | '[' | ']'))
    {
        return None;
    }
    Some((name.to_string(), rhs.to_string()))
}

fn is_comment(line: &str) -> bool {
    let t = line.trim_start();
    if t.starts_with("#include") || t.starts_with("#!") {
        return false;
    }
    ["//", "/*", "*", "#", "<!--", "--"]
        .iter()
        .any(|p| t.starts_with(p))
}

fn is_import(line: &str) -> bool {
    let t = line.trim_start();
    ["import ", "from ", "use ", "require", "export ", "#include", "include "]
        .iter()
        .any(|p| t.starts_with(p))
}

// ───────────────────────────────────────────────────────────────────
// The resolver
// ───────────────────────────────────────────────────────────────────

/// Outcome of one merge tier before it is wrapped into a [`ConflictResolution`].
struct MergeAttempt {
    content: String,
    sections: Vec<ConflictSection>,
    auto: bool,
}

/// Heuristic verdict for a single conflicting line pair.
struct LineVerdict {
    merged: String,
    confidence: f32,
}

/// Stateless three-tier merge engine.
#[derive(Debug, Default, Clone)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Merge `local` and `remote` against their common ancestor `base`.
    ///
    /// `file_path` selects the semantic-tier patterns; `user_id` is stamped
    /// into the resolution metadata. Inputs are never mutated.
    pub fn resolve(
        &self,
        base: &str,
        local: &str,
        remote: &str,
        file_path: &str,
        user_id: &str,
    ) -> Result<ConflictResolution, ResolverError> {
        // No real conflict: both sides arrived at the same content.
        if local == remote {
            return Ok(ConflictResolution {
                strategy: MergeStrategy::SmartMerge,
                resolved_content: local.to_string(),
                conflicted_sections: Vec::new(),
                metadata: ResolutionMetadata {
                    kind: ConflictKind::Textual,
                    severity: Severity::Low,
                    auto_resolved: true,
                    user_id: user_id.to_string(),
                    timestamp: now_ms(),
                },
            });
        }

        let lines = base.lines().count().max(local.lines().count()).max(remote.lines().count());
        if lines > MAX_MERGE_LINES {
            return Err(ResolverError::TooLarge { lines });
        }

        // Tier 1: line-level 3-way merge.
        let tier1 = self.smart_merge(base, local, remote);
        if tier1.auto {
            let severity = if tier1.sections.is_empty() {
                Severity::Low
            } else {
                Severity::Medium
            };
            return Ok(ConflictResolution {
                strategy: MergeStrategy::SmartMerge,
                resolved_content: tier1.content,
                conflicted_sections: tier1.sections,
                metadata: ResolutionMetadata {
                    kind: ConflictKind::Textual,
                    severity,
                    auto_resolved: true,
                    user_id: user_id.to_string(),
                    timestamp: now_ms(),
                },
            });
        }

        // A lone same-variable assignment conflict is already classified
        // definitively; the block tier would only second-guess it.
        let lone_assignment = tier1.sections.len() == 1
            && tier1.sections.iter().all(|s| {
                s.resolution == SectionResolution::Manual && same_variable_conflict(&s.local, &s.remote)
            });

        let category = FileCategory::from_path(file_path);
        let mut semantic_ran = false;
        if !lone_assignment {
            if let Some(tier2) = self.semantic_merge(base, local, remote, category) {
                semantic_ran = true;
                if tier2.auto {
                    return Ok(ConflictResolution {
                        strategy: MergeStrategy::SemanticMerge,
                        resolved_content: tier2.content,
                        conflicted_sections: tier2.sections,
                        metadata: ResolutionMetadata {
                            kind: ConflictKind::Semantic,
                            severity: Severity::Medium,
                            auto_resolved: true,
                            user_id: user_id.to_string(),
                            timestamp: now_ms(),
                        },
                    });
                }
            }
        }

        // Tier 3: surface the whole divergence to the user.
        let content = format!("<<<<<<< LOCAL\n{local}\n=======\n{remote}\n>>>>>>> REMOTE");
        let line_count = content.lines().count();
        Ok(ConflictResolution {
            strategy: MergeStrategy::Manual,
            conflicted_sections: vec![ConflictSection {
                start: 0,
                end: line_count.saturating_sub(1),
                local: local.to_string(),
                remote: remote.to_string(),
                resolution: SectionResolution::Manual,
                confidence: 0.0,
            }],
            resolved_content: content,
            metadata: ResolutionMetadata {
                kind: if semantic_ran {
                    ConflictKind::Structural
                } else {
                    ConflictKind::Textual
                },
                severity: Severity::High,
                auto_resolved: false,
                user_id: user_id.to_string(),
                timestamp: now_ms(),
            },
        })
    }

    /// Tier 1: walk the three line arrays in lockstep.
    fn smart_merge(&self, base: &str, local: &str, remote: &str) -> MergeAttempt {
        let b: Vec<&str> = base.lines().collect();
        let l: Vec<&str> = local.lines().collect();
        let r: Vec<&str> = remote.lines().collect();
        let len = b.len().max(l.len()).max(r.len());

        let mut out: Vec<String> = Vec::with_capacity(len);
        let mut sections = Vec::new();
        let mut auto = true;

        for i in 0..len {
            let bl = b.get(i).copied();
            let ll = l.get(i).copied();
            let rl = r.get(i).copied();

            match (ll, rl) {
                (Some(lv), Some(rv)) => {
                    if lv == rv {
                        out.push(lv.to_string());
                    } else if Some(lv) == bl {
                        // Only remote touched this line.
                        out.push(rv.to_string());
                    } else if Some(rv) == bl {
                        // Only local touched this line.
                        out.push(lv.to_string());
                    } else {
                        let verdict = judge_line_conflict(lv, rv);
                        if verdict.confidence >= AUTO_RESOLVE_CONFIDENCE {
                            out.push(verdict.merged);
                            sections.push(ConflictSection {
                                start: out.len() - 1,
                                end: out.len() - 1,
                                local: lv.to_string(),
                                remote: rv.to_string(),
                                resolution: SectionResolution::Auto,
                                confidence: verdict.confidence,
                            });
                        } else {
                            let start = out.len();
                            out.push("<<<<<<< LOCAL".to_string());
                            out.push(lv.to_string());
                            out.push("=======".to_string());
                            out.push(rv.to_string());
                            out.push(">>>>>>> REMOTE".to_string());
                            sections.push(ConflictSection {
                                start,
                                end: out.len() - 1,
                                local: lv.to_string(),
                                remote: rv.to_string(),
                                resolution: SectionResolution::Manual,
                                confidence: verdict.confidence,
                            });
                            auto = false;
                        }
                    }
                }
                // One side ran out of lines: keep the extra line unless it is
                // an unchanged base line the other side deleted.
                (Some(lv), None) => {
                    if Some(lv) != bl {
                        out.push(lv.to_string());
                    }
                }
                (None, Some(rv)) => {
                    if Some(rv) != bl {
                        out.push(rv.to_string());
                    }
                }
                (None, None) => {}
            }
        }

        MergeAttempt {
            content: out.join("\n"),
            sections,
            auto,
        }
    }

    /// Tier 2: merge at the granularity of structural blocks.
    ///
    /// Returns `None` when the file category has no registered patterns.
    fn semantic_merge(
        &self,
        base: &str,
        local: &str,
        remote: &str,
        category: FileCategory,
    ) -> Option<MergeAttempt> {
        let matchers = category.block_matchers();
        if matchers.is_empty() {
            return None;
        }

        let base_blocks = extract_blocks(base, matchers);
        let local_blocks = extract_blocks(local, matchers);
        let remote_blocks = extract_blocks(remote, matchers);

        // Union of block ids, first-seen order across base → local → remote.
        let mut order: Vec<String> = Vec::new();
        for (key, _) in base_blocks.iter().chain(&local_blocks).chain(&remote_blocks) {
            if !order.contains(key) {
                order.push(key.clone());
            }
        }

        let bm: HashMap<&str, &str> = index(&base_blocks);
        let lm: HashMap<&str, &str> = index(&local_blocks);
        let rm: HashMap<&str, &str> = index(&remote_blocks);

        let mut resolved: HashMap<String, Option<String>> = HashMap::new();
        let mut conflicts: HashMap<String, (String, String, f32)> = HashMap::new();
        let mut auto = true;

        for key in &order {
            let bv = bm.get(key.as_str()).copied();
            let lv = lm.get(key.as_str()).copied();
            let rv = rm.get(key.as_str()).copied();

            let value = if lv == rv {
                lv
            } else if lv == bv {
                rv
            } else if rv == bv {
                lv
            } else {
                // Both sides changed the block, differently.
                match (lv, rv) {
                    (Some(lvv), Some(rvv)) => {
                        if same_variable_conflict(lvv, rvv) {
                            auto = false;
                            lv
                        } else {
                            conflicts.insert(key.clone(), (lvv.to_string(), rvv.to_string(), 0.7));
                            lv
                        }
                    }
                    // Edit on one side beats deletion on the other.
                    (one, other) => {
                        let kept = one.or(other);
                        conflicts.insert(
                            key.clone(),
                            (
                                lv.unwrap_or("").to_string(),
                                rv.unwrap_or("").to_string(),
                                0.7,
                            ),
                        );
                        kept
                    }
                }
            };
            resolved.insert(key.clone(), value.map(str::to_string));
        }

        // Rebuild on the local skeleton, then append remote-only blocks.
        let mut out: Vec<String> = Vec::new();
        let mut sections = Vec::new();
        let mut emitted: std::collections::HashSet<String> = std::collections::HashSet::new();

        let emit = |key: &str,
                        out: &mut Vec<String>,
                        sections: &mut Vec<ConflictSection>,
                        emitted: &mut std::collections::HashSet<String>| {
            if emitted.contains(key) {
                return;
            }
            emitted.insert(key.to_string());
            if let Some(Some(value)) = resolved.get(key) {
                out.push(value.clone());
                if let Some((lv, rv, conf)) = conflicts.get(key) {
                    sections.push(ConflictSection {
                        start: out.len() - 1,
                        end: out.len() - 1,
                        local: lv.clone(),
                        remote: rv.clone(),
                        resolution: SectionResolution::Auto,
                        confidence: *conf,
                    });
                }
            }
        };

        for line in local.lines() {
            if line.trim().is_empty() {
                out.push(line.to_string());
                continue;
            }
            let key = block_key(line, matchers);
            emit(&key, &mut out, &mut sections, &mut emitted);
        }
        for (key, _) in &remote_blocks {
            emit(key, &mut out, &mut sections, &mut emitted);
        }

        Some(MergeAttempt {
            content: out.join("\n"),
            sections,
            auto,
        })
    }
}

/// Stable block id for a line: first matcher wins, free text keys on its
/// normalized form.
fn block_key(line: &str, matchers: &[BlockMatcher]) -> String {
    for m in matchers {
        if let Some(key) = m(line) {
            return key;
        }
    }
    format!("text:{}", normalize(line))
}

/// Extract `(block id, line)` pairs in document order, skipping blanks.
fn extract_blocks(text: &str, matchers: &[BlockMatcher]) -> Vec<(String, String)> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| (block_key(l, matchers), l.to_string()))
        .collect()
}

fn index<'a>(blocks: &'a [(String, String)]) -> HashMap<&'a str, &'a str> {
    // Last occurrence wins, matching document order.
    blocks
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

/// True when both lines assign different values to the same identifier.
fn same_variable_conflict(local: &str, remote: &str) -> bool {
    match (parse_assignment(local), parse_assignment(remote)) {
        (Some((ln, lrhs)), Some((rn, rrhs))) => ln == rn && lrhs != rrhs,
        _ => false,
    }
}

/// Priority-ordered heuristic for a pair of lines that both diverged from base.
fn judge_line_conflict(local: &str, remote: &str) -> LineVerdict {
    // Same identifier, different value: never safe to pick one silently.
    if same_variable_conflict(local, remote) {
        return LineVerdict {
            merged: local.to_string(),
            confidence: 0.1,
        };
    }
    // Competing comments: longer text is assumed the more complete one.
    if is_comment(local) && is_comment(remote) {
        let merged = if remote.trim().len() > local.trim().len() {
            remote
        } else {
            local
        };
        return LineVerdict {
            merged: merged.to_string(),
            confidence: 0.9,
        };
    }
    // Pure whitespace disagreement.
    if local.trim() == remote.trim() {
        return LineVerdict {
            merged: local.to_string(),
            confidence: 0.95,
        };
    }
    // Competing imports: longer line is the better proxy for completeness.
    if is_import(local) && is_import(remote) {
        let merged = if remote.trim().len() > local.trim().len() {
            remote
        } else {
            local
        };
        return LineVerdict {
            merged: merged.to_string(),
            confidence: 0.8,
        };
    }
    LineVerdict {
        merged: local.to_string(),
        confidence: 0.2,
    }
}
