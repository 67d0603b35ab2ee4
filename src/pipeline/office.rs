//! DOCX → PDF conversion through a headless LibreOffice (`soffice`).
//!
//! The converter writes `<stem>.pdf` next to nothing but our scratch
//! directory. Each invocation gets its own LibreOffice user profile inside
//! that directory: two `soffice` processes sharing the default profile
//! block on its lock file, which would serialise concurrent intakes.

use crate::error::IntakeError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Convert `input` (a `.docx` inside `outdir`) to PDF and return the PDF path.
///
/// `name` is the user-facing document name used in error messages.
pub async fn convert_to_pdf(
    soffice: &Path,
    input: &Path,
    outdir: &Path,
    timeout_secs: u64,
    name: &str,
) -> Result<PathBuf, IntakeError> {
    let failure = |detail: String| IntakeError::ConversionFailure {
        name: name.to_string(),
        detail,
    };

    let profile = outdir.join("lo-profile");
    let mut cmd = Command::new(soffice);
    cmd.arg(format!("-env:UserInstallation=file://{}", profile.display()))
        .args(["--headless", "--norestore", "--convert-to", "pdf", "--outdir"])
        .arg(outdir)
        .arg(input)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    info!("Converting {} to PDF with {}", name, soffice.display());
    let output = tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output())
        .await
        .map_err(|_| failure(format!("converter timed out after {timeout_secs}s")))?
        .map_err(|e| failure(format!("cannot run '{}': {e}", soffice.display())))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(failure(format!(
            "converter exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    debug!("soffice: {}", String::from_utf8_lossy(&output.stdout).trim());

    let pdf = expected_output(input, outdir);
    match tokio::fs::metadata(&pdf).await {
        Ok(meta) if meta.len() > 0 => Ok(pdf),
        Ok(_) => Err(failure("converter produced an empty PDF".into())),
        Err(_) => Err(failure(format!(
            "converter produced no output at {}",
            pdf.display()
        ))),
    }
}

/// Where LibreOffice puts the converted file: `<outdir>/<input stem>.pdf`.
pub fn expected_output(input: &Path, outdir: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_else(|| "document".into());
    let mut pdf = outdir.join(stem);
    pdf.set_extension("pdf");
    pdf
}
