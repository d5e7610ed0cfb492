//! Plan extraction from free-text planning responses.
//!
//! The planner is asked to answer with labeled sections (Summary, Approach,
//! Files, Considerations, Complexity) but models drift, so extraction is
//! line-oriented and tolerant: headers match with or without markdown
//! decoration, and file paths that do not name an actually-explored file are
//! fuzzy-mapped to the closest explored path.

use crate::workflow::plan::{Complexity, ExploredFile, ImplementationPlan, PlannedFile};
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use regex::Regex;
use std::sync::OnceLock;

fn header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*(?:#{1,4}\s*)?(?:\*\*)?(summary|approach|files|target files|considerations|caveats|complexity)(?:\*\*)?\s*:?\s*(.*)$",
        )
        .expect("header regex is valid")
    })
}

fn file_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // "- `src/app.ts` — rework the session handler" and friends
        Regex::new(r"^\s*(?:[-*]|\d+[.)])?\s*`?([\w./@-]+\.[\w]+)`?\s*(?:[-—:]\s*(.*))?$")
            .expect("file line regex is valid")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Summary,
    Approach,
    Files,
    Considerations,
    Complexity,
}

/// Extracts an [`ImplementationPlan`] from planner free text.
///
/// Deterministic: identical input yields an identical plan. Paths that do
/// not match an explored file are mapped to the closest explored path, and
/// the substitution is logged.
pub fn parse_plan(text: &str, explored: &[ExploredFile]) -> ImplementationPlan {
    let mut section = Section::None;
    let mut summary = Vec::new();
    let mut approach = Vec::new();
    let mut considerations = Vec::new();
    let mut complexity_text = Vec::new();
    let mut files = Vec::new();

    for line in text.lines() {
        if let Some(captures) = header_regex().captures(line) {
            let label = captures
                .get(1)
                .map(|m| m.as_str().to_lowercase())
                .unwrap_or_default();
            let rest = captures.get(2).map(|m| m.as_str().trim()).unwrap_or("");
            section = match label.as_str() {
                "summary" => Section::Summary,
                "approach" => Section::Approach,
                "files" | "target files" => Section::Files,
                "considerations" | "caveats" => Section::Considerations,
                "complexity" => Section::Complexity,
                _ => Section::None,
            };
            if !rest.is_empty() {
                match section {
                    Section::Summary => summary.push(rest.to_string()),
                    Section::Approach => approach.push(rest.to_string()),
                    Section::Considerations => considerations.push(rest.to_string()),
                    Section::Complexity => complexity_text.push(rest.to_string()),
                    Section::Files => {
                        if let Some(file) = parse_file_line(rest) {
                            files.push(file);
                        }
                    }
                    Section::None => {}
                }
            }
            continue;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match section {
            Section::Summary => summary.push(trimmed.to_string()),
            Section::Approach => approach.push(trimmed.to_string()),
            Section::Considerations => considerations.push(strip_bullet(trimmed)),
            Section::Complexity => complexity_text.push(trimmed.to_string()),
            Section::Files => {
                if let Some(file) = parse_file_line(trimmed) {
                    files.push(file);
                }
            }
            Section::None => {}
        }
    }

    let files = map_to_explored(files, explored);
    let complexity = parse_complexity(&complexity_text.join(" "), files.len());

    ImplementationPlan {
        summary: summary.join(" "),
        approach: approach.join(" "),
        files,
        complexity,
        caveats: considerations,
        raw_response: Some(text.to_string()),
    }
}

fn parse_file_line(line: &str) -> Option<PlannedFile> {
    let captures = file_line_regex().captures(line)?;
    let path = captures.get(1)?.as_str().to_string();
    let purpose = captures
        .get(2)
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();
    Some(PlannedFile { path, purpose })
}

fn strip_bullet(line: &str) -> String {
    line.trim_start_matches(['-', '*', ' ']).to_string()
}

/// Maps planned paths onto actually-explored files.
///
/// Exact matches pass through. Everything else is fuzzy-matched against the
/// explored set; ties break lexicographically so extraction stays
/// deterministic. With nothing explored, paths pass through unchanged.
fn map_to_explored(files: Vec<PlannedFile>, explored: &[ExploredFile]) -> Vec<PlannedFile> {
    if explored.is_empty() {
        return files;
    }
    let matcher = SkimMatcherV2::default();
    let mut mapped: Vec<PlannedFile> = Vec::with_capacity(files.len());

    for mut file in files {
        let exact = explored.iter().any(|e| e.path == file.path);
        if !exact {
            let best = explored
                .iter()
                .filter_map(|e| {
                    matcher
                        .fuzzy_match(&e.path, &file.path)
                        .map(|score| (score, e.path.as_str()))
                })
                .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(a.1)));
            if let Some((_, closest)) = best {
                tracing::info!(
                    requested = %file.path,
                    mapped = %closest,
                    "plan named an unexplored file, substituting closest explored path"
                );
                file.path = closest.to_string();
            }
        }
        if !mapped.iter().any(|m: &PlannedFile| m.path == file.path) {
            mapped.push(file);
        }
    }
    mapped
}

fn parse_complexity(text: &str, file_count: usize) -> Complexity {
    let lower = text.to_lowercase();
    if lower.contains("high") {
        return Complexity::High;
    }
    if lower.contains("medium") || lower.contains("moderate") {
        return Complexity::Medium;
    }
    if lower.contains("low") || lower.contains("simple") || lower.contains("trivial") {
        return Complexity::Low;
    }
    // No stated complexity: derive from plan size.
    match file_count {
        0..=2 => Complexity::Low,
        3..=6 => Complexity::Medium,
        _ => Complexity::High,
    }
}

#[cfg(test)]
#[path = "tests/plan_tests.rs"]
mod tests;
