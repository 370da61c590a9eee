//! Source policy gate for `sieve`.
//!
//! Every build scans the crate's own Rust sources and refuses to continue when a
//! file breaks one of the house rules listed in `RULES`.

use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const SOURCE_ROOTS: [&str; 4] = ["denoise", "src", "tests", "benches"];

/// One policy: a line-level regex, a predicate that confirms the match really is a
/// violation, and the advice printed when it is.
struct Rule {
    name: &'static str,
    pattern: &'static str,
    covers_build_script: bool,
    is_violation: fn(&str) -> bool,
    advice: &'static str,
}

const RULES: [Rule; 5] = [
    Rule {
        name: "underscore-prefixed identifiers",
        pattern: r"\b(_[a-zA-Z0-9_]+)\b",
        covers_build_script: true,
        is_violation: underscore_in_code,
        advice: "Use the binding under its real name or drop it.",
    },
    Rule {
        name: "#[allow(dead_code)] attributes",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        covers_build_script: false,
        is_violation: always,
        advice: "Delete the unused item; the crate roots deny dead code.",
    },
    Rule {
        name: "change-log wording in comments",
        pattern: r"(//|/\*).*(?:FIXED|CORRECTED|FIXES|FIX|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)",
        covers_build_script: false,
        is_violation: always,
        advice: "Comments describe the code as it is, not its history.",
    },
    Rule {
        name: "'**' in plain comments",
        pattern: r"(//|/\*).*\*\*",
        covers_build_script: false,
        is_violation: stars_outside_docs,
        advice: "Emphasis markup belongs in doc comments only.",
    },
    Rule {
        name: "all-caps comments",
        pattern: r"(//|/\*)",
        covers_build_script: false,
        is_violation: shouting_comment,
        advice: "Rewrite the comment in sentence case or delete it.",
    },
];

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    let mut failures = Vec::new();
    for rule in &RULES {
        match check(rule) {
            Ok(Some(report)) => failures.push(report),
            Ok(None) => {}
            Err(e) => failures.push(format!("could not check {}: {e}", rule.name)),
        }
    }
    if !failures.is_empty() {
        for report in &failures {
            eprintln!("{report}");
        }
        std::process::exit(1);
    }
}

fn rust_sources(include_build_script: bool) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = SOURCE_ROOTS
        .iter()
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.path().to_path_buf())
        .collect();
    if include_build_script {
        paths.push(PathBuf::from("build.rs"));
    }
    paths
}

/// Runs one rule over every source file; returns the report when anything matched.
fn check(rule: &Rule) -> Result<Option<String>, Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
    let mut searcher = Searcher::new();
    let mut hits = Vec::new();

    for path in rust_sources(rule.covers_build_script) {
        let mut collector = LineCollector::new(&path, rule.is_violation);
        searcher.search_path(&matcher, &path, &mut collector)?;
        hits.append(&mut collector.hits);
    }

    if hits.is_empty() {
        return Ok(None);
    }
    let mut report = format!("\nsieve source policy: {} found {} time(s)\n", rule.name, hits.len());
    for hit in &hits {
        report.push_str(&format!("   {hit}\n"));
    }
    report.push_str(&format!("   {}\n", rule.advice));
    Ok(Some(report))
}

struct LineCollector {
    file: String,
    is_violation: fn(&str) -> bool,
    hits: Vec<String>,
}

impl LineCollector {
    fn new(path: &Path, is_violation: fn(&str) -> bool) -> Self {
        Self {
            file: path.display().to_string(),
            is_violation,
            hits: Vec::new(),
        }
    }
}

impl Sink for LineCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.is_violation)(line) {
            let number = mat.line_number().unwrap_or(0);
            self.hits.push(format!("{}:{number}: {}", self.file, line.trim_start()));
        }
        Ok(true)
    }
}

fn always(line: &str) -> bool {
    !line.is_empty()
}

fn is_doc_comment(line: &str) -> bool {
    let line = line.trim_start();
    line.starts_with("///") || line.starts_with("//!")
}

/// The text after the comment marker, or `None` for lines that are code only.
fn comment_body(line: &str) -> Option<&str> {
    let start = line.find("//").or_else(|| line.find("/*"))?;
    let body = line[start + 2..].trim_start_matches(['/', '!', '*']);
    Some(body.trim_end_matches("*/").trim())
}

/// Matches inside comments or string literals are not identifiers.
fn underscore_in_code(line: &str) -> bool {
    let code = match line.find("//") {
        Some(start) => &line[..start],
        None => line,
    };
    code.split('"')
        .enumerate()
        .filter(|(i, _)| i % 2 == 0)
        .any(|(_, segment)| {
            segment
                .split(|c: char| !(c.is_alphanumeric() || c == '_'))
                .any(|word| word.len() > 1 && word.starts_with('_'))
        })
}

fn stars_outside_docs(line: &str) -> bool {
    !is_doc_comment(line) && comment_body(line).is_some_and(|body| body.contains("**"))
}

fn shouting_comment(line: &str) -> bool {
    comment_body(line).is_some_and(|body| {
        let mut letters = body.chars().filter(|c| c.is_alphabetic()).peekable();
        letters.peek().is_some() && letters.all(char::is_uppercase)
    })
}
