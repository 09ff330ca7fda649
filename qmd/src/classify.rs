//! Failure classification for finished engine invocations.
//!
//! Everything here except [`apply_repair`] is a pure function of the
//! captured output, so the matching rules can change without touching the
//! retry loop in [`crate::invoker`].

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use regex_lite::Regex;

/// Crash signatures of the engine's embedding step that must not fail an
/// indexing pass.
pub const DEFAULT_TOLERATED_EMBED_SIGNATURES: &[&str] = &[
    "attempted to call a non-gc-safe function inside a napi finalizer",
    "src/bun.js/bindings/napi.h",
    "oh no: bun has crashed",
    "panic: aborted",
];

const SHARED_LIBRARY_MARKER: &str = "Error loading shared library ";
const DOUBLED_SUFFIX: &str = ".so.so";

/// Engine subcommand an invocation belongs to, derived from its first
/// argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStep {
    Collection,
    Update,
    Embed,
    Query,
    Search,
    Get,
    Status,
    Other,
}

impl EngineStep {
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Self {
        match args.first().map(AsRef::as_ref) {
            Some("collection") => EngineStep::Collection,
            Some("update") => EngineStep::Update,
            Some("embed") => EngineStep::Embed,
            Some("query") => EngineStep::Query,
            Some("search") => EngineStep::Search,
            Some("get") => EngineStep::Get,
            Some("status") => EngineStep::Status,
            _ => EngineStep::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Return the failure to the caller immediately.
    Fatal,
    /// Re-run the same command after a short backoff.
    RetryTransient,
    /// Apply the side-effecting fix, then re-run once.
    RepairThenRetry(RepairPlan),
    /// Known crash in a non-critical step; log and continue.
    ToleratedFailure,
    /// The engine binary could not be found.
    EngineUnavailable,
}

/// A native extension the engine tried to load under a doubled `.so`
/// suffix, next to the file that actually exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairPlan {
    pub missing: PathBuf,
    pub source: PathBuf,
}

/// What a single failed attempt looked like.
#[derive(Debug, Clone, Copy)]
pub struct AttemptFailure<'a> {
    pub step: EngineStep,
    pub output: &'a str,
    pub spawn_error: Option<io::ErrorKind>,
}

#[derive(Debug, Clone)]
pub struct FailureClassifier {
    tolerated: Vec<String>,
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERATED_EMBED_SIGNATURES)
    }
}

impl FailureClassifier {
    pub fn new<S: AsRef<str>>(tolerated: &[S]) -> Self {
        let tolerated = tolerated
            .iter()
            .map(|signature| signature.as_ref().trim().to_lowercase())
            .filter(|signature| !signature.is_empty())
            .collect();
        Self { tolerated }
    }

    pub fn classify(&self, failure: &AttemptFailure<'_>) -> Classification {
        match failure.spawn_error {
            Some(io::ErrorKind::NotFound) => return Classification::EngineUnavailable,
            Some(_) => return Classification::Fatal,
            None => {}
        }
        if let Some(plan) = parse_repair_plan(failure.output) {
            return Classification::RepairThenRetry(plan);
        }
        if looks_transient(failure.output) {
            return Classification::RetryTransient;
        }
        if failure.step == EngineStep::Embed && self.is_tolerated(failure.output) {
            return Classification::ToleratedFailure;
        }
        Classification::Fatal
    }

    pub fn is_tolerated(&self, output: &str) -> bool {
        let text = output.to_lowercase();
        self.tolerated
            .iter()
            .any(|signature| text.contains(signature.as_str()))
    }
}

/// Lock contention inside the engine's store, or a model download whose
/// temporary file vanished mid-rename.
pub fn looks_transient(output: &str) -> bool {
    let text = output.to_lowercase();
    if text.contains("database is locked") || text.contains("sqlite_busy") {
        return true;
    }
    text.contains("enoent") && text.contains("rename") && text.contains(".ipull")
}

pub fn parse_repair_plan(output: &str) -> Option<RepairPlan> {
    let index = output.find(SHARED_LIBRARY_MARKER)?;
    let remainder = &output[index + SHARED_LIBRARY_MARKER.len()..];
    let separator = remainder.find(':').filter(|pos| *pos > 0)?;
    let missing = remainder[..separator].trim();
    let source = missing.strip_suffix(".so")?;
    if !missing.ends_with(DOUBLED_SUFFIX) {
        return None;
    }
    Some(RepairPlan {
        missing: PathBuf::from(missing),
        source: PathBuf::from(source),
    })
}

/// Creates the missing library path next to its source. Returns `false`
/// when the plan does not apply to the filesystem as it is now.
pub fn apply_repair(plan: &RepairPlan) -> io::Result<bool> {
    if !plan.source.exists() {
        return Ok(false);
    }
    match fs::symlink_metadata(&plan.missing) {
        Ok(_) => return Ok(false),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    match link_library(&plan.source, &plan.missing) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(true),
        Err(err) => Err(err),
    }
}

#[cfg(unix)]
fn link_library(source: &Path, missing: &Path) -> io::Result<()> {
    let target = source.file_name().map(PathBuf::from).unwrap_or_else(|| source.to_path_buf());
    std::os::unix::fs::symlink(target, missing)
}

#[cfg(not(unix))]
fn link_library(source: &Path, missing: &Path) -> io::Result<()> {
    fs::copy(source, missing).map(|_| ())
}

/// The engine has no collection or index for this workspace yet.
pub fn looks_like_index_not_ready(text: &str) -> bool {
    let text = text.to_lowercase();
    (text.contains("collection") && text.contains("not found"))
        || text.contains("no collections found")
        || text.contains("no such table")
        || text.contains("index not found")
}

/// The primary query pipeline failed in a way the lexical subcommand can
/// still answer. A query that ran out of time always qualifies.
pub fn looks_like_query_fallback(text: &str) -> bool {
    let text = text.to_lowercase();
    if text.starts_with("timed out after") {
        return true;
    }
    if text.contains("expanding query") {
        return text.contains("killed") || text.contains("timed out");
    }
    text.contains("unknown command") || text.contains("unsupported")
}

pub fn looks_like_already_exists(text: &str) -> bool {
    let text = text.to_lowercase();
    text.contains("already exists") || text.contains("duplicate")
}

pub fn looks_like_document_not_found(text: &str) -> bool {
    let text = text.to_lowercase();
    text.contains("not found") || text.contains("no such document")
}

/// Decides from `update` output whether vectors are pending.
pub fn update_reports_pending_vectors(output: &str) -> bool {
    let text = output.to_lowercase();
    if let Ok(pattern) = Regex::new(r"(\d+)\s+hash(?:es)?\s+needs?\s+vectors") {
        if let Some(count) = pattern
            .captures(&text)
            .and_then(|captures| captures.get(1))
            .and_then(|count| count.as_str().parse::<u64>().ok())
        {
            return count > 0;
        }
    }
    if text.contains("no pending changes") {
        return false;
    }
    text.contains("run 'qmd embed'")
}

/// Queries the primary pipeline handles poorly go straight to lexical
/// search.
pub fn prefers_lexical_search(query: &str) -> bool {
    let trimmed = query.trim();
    trimmed.is_empty() || trimmed.contains('\n') || trimmed.len() > 180
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn failure(step: EngineStep, output: &str) -> AttemptFailure<'_> {
        AttemptFailure {
            step,
            output,
            spawn_error: None,
        }
    }

    #[test]
    fn lock_contention_is_transient() {
        let classifier = FailureClassifier::default();
        assert_eq!(
            classifier.classify(&failure(EngineStep::Update, "Error: SQLITE_BUSY: database is locked")),
            Classification::RetryTransient
        );
    }

    #[test]
    fn model_rename_race_is_transient() {
        let classifier = FailureClassifier::default();
        let output = "ENOENT: no such file or directory, rename '/tmp/model.gguf.ipull' -> '/tmp/model.gguf'";
        assert_eq!(
            classifier.classify(&failure(EngineStep::Embed, output)),
            Classification::RetryTransient
        );
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let classifier = FailureClassifier::default();
        let attempt = AttemptFailure {
            step: EngineStep::Query,
            output: "",
            spawn_error: Some(io::ErrorKind::NotFound),
        };
        assert_eq!(classifier.classify(&attempt), Classification::EngineUnavailable);
    }

    #[test]
    fn doubled_library_suffix_yields_repair_plan() {
        let classifier = FailureClassifier::default();
        let output = "error: Error loading shared library /opt/vec0.so.so: No such file or directory";
        assert_eq!(
            classifier.classify(&failure(EngineStep::Update, output)),
            Classification::RepairThenRetry(RepairPlan {
                missing: PathBuf::from("/opt/vec0.so.so"),
                source: PathBuf::from("/opt/vec0.so"),
            })
        );
    }

    #[test]
    fn single_library_suffix_is_fatal() {
        let classifier = FailureClassifier::default();
        let output = "Error loading shared library /opt/vec0.so: No such file or directory";
        assert_eq!(
            classifier.classify(&failure(EngineStep::Update, output)),
            Classification::Fatal
        );
    }

    #[test]
    fn tolerated_signature_only_applies_to_embed() {
        let classifier = FailureClassifier::default();
        let output = "oh no: Bun has crashed. This indicates a bug in Bun";
        assert_eq!(
            classifier.classify(&failure(EngineStep::Embed, output)),
            Classification::ToleratedFailure
        );
        assert_eq!(
            classifier.classify(&failure(EngineStep::Update, output)),
            Classification::Fatal
        );
    }

    #[test]
    fn custom_allow_list_replaces_defaults() {
        let classifier = FailureClassifier::new(&["segfault in embedder"]);
        assert_eq!(
            classifier.classify(&failure(EngineStep::Embed, "panic: aborted")),
            Classification::Fatal
        );
        assert_eq!(
            classifier.classify(&failure(EngineStep::Embed, "Segfault in embedder at 0x0")),
            Classification::ToleratedFailure
        );
    }

    #[test]
    fn apply_repair_links_missing_library() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("vec0.so");
        fs::write(&source, b"elf").unwrap();
        let plan = RepairPlan {
            missing: dir.path().join("vec0.so.so"),
            source,
        };

        assert!(apply_repair(&plan).unwrap());
        assert_eq!(fs::read(&plan.missing).unwrap(), b"elf");
        assert!(!apply_repair(&plan).unwrap());
    }

    #[test]
    fn apply_repair_skips_when_source_missing() {
        let dir = tempdir().unwrap();
        let plan = RepairPlan {
            missing: dir.path().join("vec0.so.so"),
            source: dir.path().join("vec0.so"),
        };
        assert!(!apply_repair(&plan).unwrap());
        assert!(!plan.missing.exists());
    }

    #[test]
    fn index_not_ready_signatures() {
        assert!(looks_like_index_not_ready("Collection 'workspace' not found"));
        assert!(looks_like_index_not_ready("SqliteError: no such table: documents"));
        assert!(looks_like_index_not_ready("No collections found. Run qmd collection add"));
        assert!(!looks_like_index_not_ready("database is locked"));
    }

    #[test]
    fn query_fallback_signatures() {
        assert!(looks_like_query_fallback("expanding query... signal: killed"));
        assert!(looks_like_query_fallback("Expanding query timed out after 30s"));
        assert!(looks_like_query_fallback("error: unknown command 'query'"));
        assert!(looks_like_query_fallback("killed by signal SIGTERM Expanding query (3 variants)"));
        assert!(looks_like_query_fallback("timed out after 30s"));
        assert!(!looks_like_query_fallback("expanding query"));
        assert!(!looks_like_query_fallback("exit status: 1 database is locked"));
    }

    #[test]
    fn update_output_heuristic() {
        assert!(update_reports_pending_vectors("Indexed 3 files\n12 hashes need vectors"));
        assert!(update_reports_pending_vectors("1 hash needs vectors"));
        assert!(!update_reports_pending_vectors("0 hashes need vectors"));
        assert!(update_reports_pending_vectors(
            "Run 'qmd embed' to update embeddings"
        ));
        assert!(!update_reports_pending_vectors("No pending changes"));
        assert!(!update_reports_pending_vectors("Indexed 3 files"));
    }

    #[test]
    fn long_or_multiline_queries_prefer_lexical_search() {
        assert!(prefers_lexical_search("first line\nsecond line"));
        assert!(prefers_lexical_search(&"x".repeat(181)));
        assert!(!prefers_lexical_search("deploy checklist"));
    }

    #[test]
    fn step_from_args() {
        assert_eq!(EngineStep::from_args(&["embed"]), EngineStep::Embed);
        assert_eq!(
            EngineStep::from_args(&["collection", "add", "."]),
            EngineStep::Collection
        );
        let empty: [&str; 0] = [];
        assert_eq!(EngineStep::from_args(&empty), EngineStep::Other);
    }
}
