//! Remote traceback rendering

use std::fs;
use std::path::Path;

use graft_ipc::StackFrame;

const HEADER: &str = "Remote traceback (innermost first):";

/// Render frames innermost first, one line per frame. Frames pointing at an
/// existing local source file with one of `source_extensions` get the
/// source line appended.
pub fn render_trace(stack: &[StackFrame], source_extensions: &[String]) -> String {
    if stack.is_empty() {
        return String::new();
    }

    let mut lines = vec![HEADER.to_string()];
    for frame in stack {
        let routine = if frame.name.is_empty() {
            "<top>"
        } else {
            frame.name.as_str()
        };
        lines.push(format!(
            "  File \"{}\", line {}, in {}",
            frame.file.as_deref().unwrap_or("<unknown>"),
            frame.line,
            routine
        ));

        let source = frame
            .file
            .as_deref()
            .map(Path::new)
            .filter(|path| has_source_extension(path, source_extensions))
            .and_then(|path| source_line(path, frame.line));
        if let Some(source) = source {
            lines.push(format!("    {}", source.trim()));
        }
    }
    lines.join("\n")
}

fn has_source_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| e == ext))
}

/// Best effort; unreadable files and out-of-range lines yield nothing
fn source_line(path: &Path, line: i64) -> Option<String> {
    let index = usize::try_from(line).ok()?.checked_sub(1)?;
    let text = fs::read_to_string(path).ok()?;
    text.lines()
        .nth(index)
        .map(str::to_string)
        .filter(|l| !l.trim().is_empty())
}
