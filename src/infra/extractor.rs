use std::{
    io::{ErrorKind, Write},
    path::PathBuf,
    process::Stdio,
    time::Instant,
};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{info, warn};

use crate::application::ports::{CssExtractor, ExtractionError, ExtractionRequest};

/// Runs an external critical-CSS tool.
///
/// Invocation: `{bin} {page.html} --width W --height H [--css FILE]...
/// [--ignore RULE]... --timeout MS`. The tool prints the CSS on stdout.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    bin: PathBuf,
}

impl CommandExtractor {
    pub fn new(bin: PathBuf) -> Self {
        Self { bin }
    }

    fn command(&self, page: &NamedTempFile, request: &ExtractionRequest<'_>) -> Command {
        let mut command = Command::new(&self.bin);
        command
            .arg(page.path())
            .arg("--width")
            .arg(request.width.to_string())
            .arg("--height")
            .arg(request.height.to_string());
        for stylesheet in request.stylesheets {
            command.arg("--css").arg(stylesheet);
        }
        for rule in request.ignore {
            command.arg("--ignore").arg(rule);
        }
        command
            .arg("--timeout")
            .arg(request.timeout.as_millis().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl CssExtractor for CommandExtractor {
    async fn extract(&self, request: ExtractionRequest<'_>) -> Result<String, ExtractionError> {
        let started_at = Instant::now();

        let mut page = tempfile::Builder::new()
            .prefix("abovefold-")
            .suffix(".html")
            .tempfile()?;
        page.write_all(request.html.as_bytes())?;
        page.flush()?;

        let child = self.command(&page, &request).spawn().map_err(|err| {
            warn!(
                target = "infra::extractor",
                op = "extractor::extract",
                result = "error",
                error_code = "spawn",
                bin = %self.bin.display(),
                error = %err,
                "Failed to spawn critical CSS extractor"
            );
            if err.kind() == ErrorKind::NotFound || err.kind() == ErrorKind::PermissionDenied {
                ExtractionError::Spawn {
                    bin: self.bin.clone(),
                    source: err,
                }
            } else {
                ExtractionError::Io(err)
            }
        })?;

        // Dropping the pending future kills the child.
        let output = match tokio::time::timeout(request.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(
                    target = "infra::extractor",
                    op = "extractor::extract",
                    result = "error",
                    error_code = "timeout",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    width = request.width,
                    "Critical CSS extractor timed out"
                );
                return Err(ExtractionError::Timeout {
                    timeout: request.timeout,
                });
            }
        };

        if !output.status.success() {
            let exit_code = output.status.code();
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(
                target = "infra::extractor",
                op = "extractor::extract",
                result = "error",
                error_code = "exit",
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                exit_code = exit_code.map(i64::from).unwrap_or(-1),
                stderr = %stderr,
                "Critical CSS extractor failed"
            );
            return Err(ExtractionError::Exit { exit_code, stderr });
        }

        let css = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if css.is_empty() {
            return Err(ExtractionError::Empty);
        }

        info!(
            target = "infra::extractor",
            op = "extractor::extract",
            result = "ok",
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            width = request.width,
            height = request.height,
            css_bytes = css.len(),
            "Critical CSS extracted"
        );
        Ok(css)
    }
}
