//! External generation backend invoker.
//!
//! The backend is an opaque subprocess (`<program> run-custom-prompt ...`)
//! that, on success, writes exactly one file at a deterministic path under
//! the output directory: `<base><ext>`, or `<base>-{index}of{total}-<ext>`
//! when a pagination pair is given. The call blocks until the subprocess
//! exits; no timeout is applied at this layer.

use std::path::{Path, PathBuf};
use std::process::Command;

/// Overrides the backend program name (default `pcpt.sh`).
pub const BACKEND_ENV: &str = "RULELOG_BACKEND";
pub const DEFAULT_BACKEND: &str = "pcpt.sh";

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to launch backend `{program}`")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("backend exited with {status}")]
    InvocationFailure { status: std::process::ExitStatus },
    #[error("backend succeeded but produced no file at {expected}")]
    ExpectedOutputMissing { expected: PathBuf },
}

#[derive(Debug)]
pub struct BackendRequest<'a> {
    pub input_file: &'a Path,
    pub input_file2: Option<&'a Path>,
    pub output_dir: &'a Path,
    /// Expected output file, relative to `output_dir` (the pagination
    /// suffix is inserted before the extension).
    pub output_file: &'a str,
    pub page: Option<(usize, usize)>,
    pub template: &'a str,
}

/// The deterministic path the backend writes its single output file to.
#[must_use]
pub fn expected_output_path(
    output_dir: &Path,
    output_file: &str,
    page: Option<(usize, usize)>,
) -> PathBuf {
    let relative = Path::new(output_file);
    let parent = relative.parent().unwrap_or_else(|| Path::new(""));
    let stem = relative.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let extension = relative
        .extension()
        .and_then(|s| s.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default();
    let name = match page {
        Some((index, total)) => format!("{stem}-{index}of{total}-{extension}"),
        None => format!("{stem}{extension}"),
    };
    output_dir.join(parent).join(name)
}

/// Invoke the backend and return the path of the file it produced.
///
/// # Errors
///
/// `Launch` when the subprocess cannot start, `InvocationFailure` on a
/// non-zero exit, `ExpectedOutputMissing` when the subprocess succeeded but
/// the deterministic output path holds no file. All three are per-item
/// conditions for callers iterating a batch.
pub fn run_custom_prompt(request: &BackendRequest<'_>) -> Result<PathBuf, BackendError> {
    let expected = expected_output_path(request.output_dir, request.output_file, request.page);

    // Remove any stale output so a leftover file cannot masquerade as a
    // fresh result.
    let _ = std::fs::remove_file(&expected);
    if let Some(parent) = expected.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let program = std::env::var(BACKEND_ENV).unwrap_or_else(|_| DEFAULT_BACKEND.to_string());
    let mut command = Command::new(&program);
    command.arg("run-custom-prompt");
    command.arg("--input-file").arg(request.input_file);
    if let Some(second) = request.input_file2 {
        command.arg("--input-file2").arg(second);
    }
    command.arg("--output").arg(request.output_dir);
    if let Some((index, total)) = request.page {
        command.arg("--index").arg(index.to_string());
        command.arg("--total").arg(total.to_string());
    }
    command.arg(request.input_file2.unwrap_or(request.input_file));
    command.arg(request.template);

    tracing::debug!(program, template = request.template, "invoking backend");
    let status = command
        .status()
        .map_err(|source| BackendError::Launch { program: program.clone(), source })?;
    if !status.success() {
        return Err(BackendError::InvocationFailure { status });
    }
    if !expected.exists() {
        return Err(BackendError::ExpectedOutputMissing { expected });
    }
    Ok(expected)
}
