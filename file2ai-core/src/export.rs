//! Consolidated export documents: every text file of a source in one `.txt`
//! or `.json` file, with commit metadata and summary statistics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dispatch::TargetFormat;
use crate::source::CommitInfo;

const RULE: &str =
    "================================================================================";
const THIN_RULE: &str =
    "--------------------------------------------------------------------------------";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportEntry {
    pub path: String,
    pub content: String,
    pub last_commit: Option<CommitInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportStats {
    pub processed_files: usize,
    pub skipped_files: usize,
    /// Dropped by `.gitignore` or the default ignore set.
    pub ignored_files: usize,
    pub binary_files: usize,
    pub error_files: usize,
    pub total_chars: usize,
    pub total_lines: usize,
    /// Rough token estimate, four characters per token.
    pub total_tokens: usize,
}

impl ExportStats {
    pub fn record(&mut self, content: &str) {
        let chars = content.chars().count();
        self.processed_files += 1;
        self.total_chars += chars;
        self.total_lines += content.lines().count();
        self.total_tokens += chars.div_ceil(4);
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExportDocument {
    pub name: String,
    pub entries: Vec<ExportEntry>,
    pub stats: ExportStats,
}

#[derive(Serialize)]
struct JsonExport<'a> {
    repository: &'a str,
    files: &'a [ExportEntry],
    stats: &'a ExportStats,
}

impl ExportDocument {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn push(&mut self, path: String, content: String, last_commit: Option<CommitInfo>) {
        self.stats.record(&content);
        self.entries.push(ExportEntry {
            path,
            content,
            last_commit,
        });
    }

    /// Default file name, `<name>_export.txt` or `<name>_export.json`.
    pub fn default_file_name(&self, format: TargetFormat) -> String {
        let ext = match format {
            TargetFormat::Json => "json",
            _ => "txt",
        };
        format!("{}_export.{ext}", self.name)
    }

    pub fn render(&self, format: TargetFormat) -> Result<String, serde_json::Error> {
        match format {
            TargetFormat::Json => self.render_json(),
            _ => Ok(self.render_text()),
        }
    }

    pub fn render_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&JsonExport {
            repository: &self.name,
            files: &self.entries,
            stats: &self.stats,
        })
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str("Generated by file2ai\n");
        out.push_str(RULE);
        out.push('\n');
        out.push_str(&format!("Repository: {}\n\n", self.name));
        out.push_str("Directory Structure:\n");
        out.push_str(&directory_tree(self.entries.iter().map(|e| e.path.as_str())));
        out.push('\n');

        for entry in &self.entries {
            out.push_str(RULE);
            out.push('\n');
            out.push_str(&format!("File: {}\n", entry.path));
            out.push_str(THIN_RULE);
            out.push('\n');
            if let Some(commit) = &entry.last_commit {
                out.push_str(&format!(
                    "Last Commit: {} by {} on {}\n",
                    commit.message, commit.author, commit.date
                ));
                out.push_str(THIN_RULE);
                out.push('\n');
            }
            out.push_str(&entry.content);
            if !entry.content.ends_with('\n') {
                out.push('\n');
            }
            out.push('\n');
        }

        let s = &self.stats;
        out.push_str(RULE);
        out.push('\n');
        out.push_str("File Statistics:\n");
        out.push_str(&format!("- Processed files: {}\n", s.processed_files));
        out.push_str(&format!("- Skipped binary files: {}\n", s.binary_files));
        out.push_str(&format!("- Filtered files: {}\n", s.skipped_files));
        out.push_str(&format!("- Ignored files: {}\n", s.ignored_files));
        out.push_str(&format!("- Files with errors: {}\n", s.error_files));
        out.push_str(&format!("- Total characters: {}\n", s.total_chars));
        out.push_str(&format!("- Total lines: {}\n", s.total_lines));
        out.push_str(&format!("- Approximate tokens: {}\n", s.total_tokens));
        out
    }
}

#[derive(Default)]
struct Node(BTreeMap<String, Node>);

/// Indented tree of the given paths, directories suffixed with `/`.
pub fn directory_tree<'a>(paths: impl IntoIterator<Item = &'a str>) -> String {
    let mut root = Node::default();
    for path in paths {
        let mut node = &mut root;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            node = node.0.entry(part.to_string()).or_default();
        }
    }

    fn render(node: &Node, depth: usize, out: &mut String) {
        // Directories first, then files, each group in name order.
        let (dirs, files): (Vec<_>, Vec<_>) =
            node.0.iter().partition(|(_, child)| !child.0.is_empty());
        for (name, child) in dirs {
            out.push_str(&format!("{}{}/\n", "  ".repeat(depth), name));
            render(child, depth + 1, out);
        }
        for (name, _) in files {
            out.push_str(&format!("{}{}\n", "  ".repeat(depth), name));
        }
    }

    let mut out = String::new();
    render(&root, 0, &mut out);
    out
}
