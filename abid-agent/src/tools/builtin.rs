//! Local file and shell tools.

use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};

use super::{ToolDescriptor, ToolEffect, ToolError, ToolFuture, ToolResult, ToolTrait};

const MAX_GREP_MATCHES: usize = 200;

fn required_str<'a>(arguments: &'a Map<String, Value>, key: &str) -> Result<&'a str, ToolError> {
    arguments
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidArguments(format!("Missing '{key}' argument")))
}

fn optional_str<'a>(arguments: &'a Map<String, Value>, key: &str, default: &'a str) -> &'a str {
    arguments.get(key).and_then(|v| v.as_str()).unwrap_or(default)
}

pub struct FileReadTool {
    base_path: PathBuf,
}

impl FileReadTool {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }
}

impl ToolTrait for FileReadTool {
    fn info(&self) -> ToolDescriptor {
        ToolDescriptor::local(
            "read_file",
            "Read the contents of a file",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path to the file to read"
                    }
                },
                "required": ["path"]
            }),
            ToolEffect::ReadOnly,
        )
    }

    fn execute(&self, arguments: Map<String, Value>) -> ToolFuture {
        let base_path = self.base_path.clone();
        Box::pin(async move {
            let path = required_str(&arguments, "path")?;
            let content = tokio::fs::read_to_string(base_path.join(path)).await?;
            let bytes = content.len();
            Ok(ToolResult::success(content).with_metadata(json!({
                "path": path,
                "bytes": bytes
            })))
        })
    }
}

pub struct FileWriteTool {
    base_path: PathBuf,
}

impl FileWriteTool {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }
}

impl ToolTrait for FileWriteTool {
    fn info(&self) -> ToolDescriptor {
        ToolDescriptor::local(
            "write_file",
            "Write content to a file, creating parent directories as needed",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path to the file to write"
                    },
                    "content": {
                        "type": "string",
                        "description": "Content to write to the file"
                    }
                },
                "required": ["path", "content"]
            }),
            ToolEffect::Edit,
        )
    }

    fn execute(&self, arguments: Map<String, Value>) -> ToolFuture {
        let base_path = self.base_path.clone();
        Box::pin(async move {
            let path = required_str(&arguments, "path")?;
            let content = required_str(&arguments, "content")?;
            let full_path = base_path.join(path);

            if let Some(parent) = full_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let previous = tokio::fs::read_to_string(&full_path).await.ok();
            tokio::fs::write(&full_path, content).await?;

            let created = previous.is_none();
            let diff = line_diff(path, previous.as_deref().unwrap_or(""), content);
            let message = if created {
                format!("Created {path}")
            } else {
                format!("Updated {path}")
            };
            Ok(ToolResult::success(message)
                .with_diff(diff)
                .with_metadata(json!({
                    "path": path,
                    "bytes": content.len(),
                    "created": created
                })))
        })
    }
}

/// A single-hunk diff: common leading and trailing lines are elided.
pub fn line_diff(path: &str, old: &str, new: &str) -> String {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let prefix = old_lines
        .iter()
        .zip(&new_lines)
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = old_lines[prefix..]
        .iter()
        .rev()
        .zip(new_lines[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let mut diff = format!("--- a/{path}\n+++ b/{path}\n");
    if prefix == old_lines.len() && prefix == new_lines.len() {
        return diff;
    }
    diff.push_str(&format!(
        "@@ -{},{} +{},{} @@\n",
        prefix + 1,
        old_lines.len() - prefix - suffix,
        prefix + 1,
        new_lines.len() - prefix - suffix
    ));
    for line in &old_lines[prefix..old_lines.len() - suffix] {
        diff.push('-');
        diff.push_str(line);
        diff.push('\n');
    }
    for line in &new_lines[prefix..new_lines.len() - suffix] {
        diff.push('+');
        diff.push_str(line);
        diff.push('\n');
    }
    diff
}

pub struct ListDirTool {
    base_path: PathBuf,
}

impl ListDirTool {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }
}

impl ToolTrait for ListDirTool {
    fn info(&self) -> ToolDescriptor {
        ToolDescriptor::local(
            "list_dir",
            "List directory contents; directories end with '/'",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path to the directory to list (default: working directory)"
                    }
                }
            }),
            ToolEffect::ReadOnly,
        )
    }

    fn execute(&self, arguments: Map<String, Value>) -> ToolFuture {
        let base_path = self.base_path.clone();
        Box::pin(async move {
            let path = optional_str(&arguments, "path", ".");
            let mut entries = tokio::fs::read_dir(base_path.join(path)).await?;

            let mut names = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let mut name = entry.file_name().to_string_lossy().to_string();
                if entry.file_type().await?.is_dir() {
                    name.push('/');
                }
                names.push(name);
            }
            names.sort();

            let count = names.len();
            Ok(ToolResult::success(names.join("\n")).with_metadata(json!({
                "path": path,
                "count": count
            })))
        })
    }
}

pub struct GrepTool {
    base_path: PathBuf,
}

impl GrepTool {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn find_files(dir: &Path, file_pattern: &str, results: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if path.is_dir() && !hidden {
                Self::find_files(&path, file_pattern, results);
            } else if path.is_file() && matches_file_pattern(&path, file_pattern) {
                results.push(path);
            }
        }
    }
}

fn matches_file_pattern(path: &Path, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match (pattern.strip_prefix("*."), path.extension()) {
        (Some(wanted), Some(ext)) => ext.to_string_lossy() == wanted,
        (Some(_), None) => false,
        (None, _) => path
            .file_name()
            .is_some_and(|name| name.to_string_lossy() == pattern),
    }
}

impl ToolTrait for GrepTool {
    fn info(&self) -> ToolDescriptor {
        ToolDescriptor::local(
            "grep",
            "Search for a literal pattern in files",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {
                        "type": "string",
                        "description": "Text to search for"
                    },
                    "path": {
                        "type": "string",
                        "description": "Directory to search in (default: working directory)"
                    },
                    "file_pattern": {
                        "type": "string",
                        "description": "File pattern to match (e.g., *.rs)"
                    }
                },
                "required": ["pattern"]
            }),
            ToolEffect::ReadOnly,
        )
    }

    fn execute(&self, arguments: Map<String, Value>) -> ToolFuture {
        let base_path = self.base_path.clone();
        Box::pin(async move {
            let pattern = required_str(&arguments, "pattern")?.to_string();
            let path = optional_str(&arguments, "path", ".");
            let file_pattern = optional_str(&arguments, "file_pattern", "*").to_string();
            let search_path = base_path.join(path);

            let walk_root = search_path.clone();
            let mut files = tokio::task::spawn_blocking(move || {
                let mut files = Vec::new();
                GrepTool::find_files(&walk_root, &file_pattern, &mut files);
                files
            })
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
            files.sort();

            let mut lines = Vec::new();
            let mut truncated = false;
            'files: for file in files {
                let Ok(content) = tokio::fs::read_to_string(&file).await else {
                    continue;
                };
                let shown = file.strip_prefix(&search_path).unwrap_or(&file);
                for (line_no, line) in content.lines().enumerate() {
                    if line.contains(&pattern) {
                        if lines.len() >= MAX_GREP_MATCHES {
                            truncated = true;
                            break 'files;
                        }
                        lines.push(format!("{}:{}: {}", shown.display(), line_no + 1, line.trim()));
                    }
                }
            }

            let count = lines.len();
            let output = if lines.is_empty() {
                format!("No matches for '{pattern}'")
            } else {
                lines.join("\n")
            };
            Ok(ToolResult::success(output).with_metadata(json!({
                "pattern": pattern,
                "matches": count,
                "truncated": truncated
            })))
        })
    }
}

pub struct RunCommandTool {
    base_path: PathBuf,
}

impl RunCommandTool {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }
}

impl ToolTrait for RunCommandTool {
    fn info(&self) -> ToolDescriptor {
        ToolDescriptor::local(
            "run_command",
            "Run a shell command in the working directory",
            json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "Command to run"
                    }
                },
                "required": ["command"]
            }),
            ToolEffect::Execute,
        )
    }

    fn execute(&self, arguments: Map<String, Value>) -> ToolFuture {
        let base_path = self.base_path.clone();
        Box::pin(async move {
            let command = required_str(&arguments, "command")?;

            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&base_path)
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut text = stdout.trim_end().to_string();
            if !stderr.trim().is_empty() {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(stderr.trim_end());
            }

            let exit_code = output.status.code();
            let result = if output.status.success() {
                ToolResult::success(text)
            } else {
                let reason = match exit_code {
                    Some(code) => format!("Command exited with code {code}"),
                    None => "Command terminated by signal".to_string(),
                };
                ToolResult::failure(reason).with_output(text)
            };
            Ok(result
                .with_exit_code(exit_code)
                .with_metadata(json!({ "command": command })))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn test_list_dir_sorted_with_dir_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();

        let tool = ListDirTool::new(dir.path().to_path_buf());
        let result = tool.execute(args(json!({"path": "."}))).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output, "a.txt\nb.txt\nsrc/");
        assert_eq!(result.metadata.unwrap()["count"], 3);
    }

    #[tokio::test]
    async fn test_read_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FileReadTool::new(dir.path().to_path_buf());
        let err = tool.execute(args(json!({"path": "nope.txt"}))).await.unwrap_err();
        assert!(matches!(err, ToolError::IoError(_)));

        let err = tool.execute(Map::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn test_write_file_reports_diff() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FileWriteTool::new(dir.path().to_path_buf());

        let created = tool
            .execute(args(json!({"path": "nested/a.txt", "content": "one\ntwo\n"})))
            .await
            .unwrap();
        assert_eq!(created.output, "Created nested/a.txt");

        let updated = tool
            .execute(args(json!({"path": "nested/a.txt", "content": "one\nTWO\n"})))
            .await
            .unwrap();
        assert_eq!(updated.output, "Updated nested/a.txt");
        let diff = updated.diff.unwrap();
        assert!(diff.contains("-two\n"));
        assert!(diff.contains("+TWO\n"));
        assert!(!diff.contains("-one"));

        let read = FileReadTool::new(dir.path().to_path_buf())
            .execute(args(json!({"path": "nested/a.txt"})))
            .await
            .unwrap();
        assert_eq!(read.output, "one\nTWO\n");
    }

    #[test]
    fn test_line_diff_identical() {
        assert_eq!(line_diff("x", "a\nb", "a\nb"), "--- a/x\n+++ b/x\n");
        assert_eq!(
            line_diff("x", "", "new"),
            "--- a/x\n+++ b/x\n@@ -1,0 +1,1 @@\n+new\n"
        );
    }

    #[tokio::test]
    async fn test_grep_finds_matches_and_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}\n// main entry\n").unwrap();
        std::fs::write(dir.path().join("notes.md"), "main notes\n").unwrap();
        std::fs::write(dir.path().join(".git/config"), "main\n").unwrap();

        let tool = GrepTool::new(dir.path().to_path_buf());
        let result = tool
            .execute(args(json!({"pattern": "main", "file_pattern": "*.rs"})))
            .await
            .unwrap();
        let src = Path::new("src").join("main.rs");
        assert_eq!(
            result.output,
            format!("{0}:1: fn main() {{}}\n{0}:2: // main entry", src.display())
        );

        let all = tool.execute(args(json!({"pattern": "main"}))).await.unwrap();
        assert_eq!(all.metadata.unwrap()["matches"], 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_captures_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let tool = RunCommandTool::new(dir.path().to_path_buf());

        let ok = tool.execute(args(json!({"command": "echo hi"}))).await.unwrap();
        assert!(ok.success);
        assert_eq!(ok.output, "hi");
        assert_eq!(ok.exit_code, Some(0));

        let failed = tool
            .execute(args(json!({"command": "echo oops >&2; exit 3"})))
            .await
            .unwrap();
        assert!(!failed.success);
        assert_eq!(failed.exit_code, Some(3));
        assert_eq!(failed.output, "oops");
        assert_eq!(failed.error.as_deref(), Some("Command exited with code 3"));
    }
}
