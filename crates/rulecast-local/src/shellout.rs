//! Bounded shellouts to the rasterizer and OCR binaries.
//!
//! Goals:
//! - **Opportunistic**: use tools when present on PATH.
//! - **Bounded**: coarse timeouts + output caps; no hangs, no huge output.
//! - **Cancellable**: the poll loop honors the caller's token and kills
//!   the child on cancel.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn timeout_from_env_ms(key: &str, default_ms: u64) -> Duration {
    let ms = env(key)
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default_ms)
        .clamp(50, 300_000);
    Duration::from_millis(ms)
}

pub fn which(bin: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let cand = dir.join(bin);
        if cand.is_file() {
            return Some(cand);
        }
    }
    None
}

pub fn has(bin: &str) -> bool {
    which(bin).is_some()
}

fn wait_bounded(
    child: &mut std::process::Child,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), &'static str> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().map_err(|_| "shellout_wait_failed")? {
            if !status.success() {
                return Err("shellout_nonzero_exit");
            }
            return Ok(());
        }
        if cancel.is_cancelled() {
            let _ = child.kill();
            return Err("shellout_canceled");
        }
        if start.elapsed() > timeout {
            let _ = child.kill();
            return Err("shellout_timeout");
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

/// Run a command and capture stdout (bounded) with a coarse timeout.
pub fn run_stdout_bounded(
    mut cmd: Command,
    timeout: Duration,
    max_stdout_bytes: usize,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, &'static str> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            "shellout_tool_not_found"
        } else {
            "shellout_spawn_failed"
        }
    })?;
    wait_bounded(&mut child, timeout, cancel)?;

    let mut out = Vec::new();
    if let Some(s) = child.stdout.take() {
        use std::io::Read;
        s.take(max_stdout_bytes as u64)
            .read_to_end(&mut out)
            .map_err(|_| "shellout_read_failed")?;
    }
    Ok(out)
}

/// Run a command for its side effects (file outputs), bounded + cancellable.
pub fn run_status_bounded(
    mut cmd: Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), &'static str> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            "shellout_tool_not_found"
        } else {
            "shellout_spawn_failed"
        }
    })?;
    wait_bounded(&mut child, timeout, cancel)
}

/// Rasterize PDF pages into `out_dir` as PNGs (one per page) and return
/// their paths in page order. `pages` bounds the run to a 1-based
/// inclusive range when present.
pub fn rasterize_pdf_pages(
    rasterizer: &str,
    pdf_path: &Path,
    pages: Option<(u32, u32)>,
    out_dir: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<PathBuf>, &'static str> {
    let timeout = timeout_from_env_ms("RULECAST_RASTERIZE_TIMEOUT_MS", 60_000);
    let prefix = out_dir.join("page");

    let mut cmd = Command::new(rasterizer);
    cmd.arg("-png").arg("-r").arg("150");
    if let Some((first, last)) = pages {
        cmd.arg("-f")
            .arg(first.to_string())
            .arg("-l")
            .arg(last.to_string());
    }
    cmd.arg(pdf_path).arg(&prefix);
    run_status_bounded(cmd, timeout, cancel)?;

    let mut pngs: Vec<PathBuf> = std::fs::read_dir(out_dir)
        .map_err(|_| "rasterize_output_unreadable")?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("png"))
        .collect();
    // pdftoppm zero-pads page numbers, but sort by (length, name) so
    // page-10 never lands before page-2 on tools that do not.
    pngs.sort_by_key(|p| (p.as_os_str().len(), p.clone()));
    if pngs.is_empty() {
        return Err("rasterize_no_output");
    }
    Ok(pngs)
}

/// OCR one PNG via tesseract, bounded.
pub fn tesseract_png(png_path: &Path, cancel: &CancellationToken) -> Result<String, &'static str> {
    let timeout = timeout_from_env_ms("RULECAST_OCR_TIMEOUT_MS", 30_000);
    let max_chars = env("RULECAST_OCR_MAX_CHARS")
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(50_000)
        .clamp(200, 2_000_000);
    let max_stdout_bytes = max_chars.saturating_mul(4).clamp(1_000, 4_000_000);

    let mut cmd = Command::new("tesseract");
    cmd.arg(png_path).arg("stdout");
    let out = run_stdout_bounded(cmd, timeout, max_stdout_bytes, cancel)?;
    let s = String::from_utf8_lossy(&out).to_string();
    let clipped: String = s.chars().take(max_chars).collect();
    if clipped.chars().any(|c| !c.is_whitespace()) {
        Ok(clipped)
    } else {
        Err("tesseract_empty_output")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn which_finds_nothing_for_nonsense() {
        assert!(which("definitely-not-a-real-binary-xyz").is_none());
        assert!(!has("definitely-not-a-real-binary-xyz"));
    }

    #[test]
    fn missing_tool_is_reported_as_not_found() {
        let cmd = Command::new("definitely-not-a-real-binary-xyz");
        let err = run_stdout_bounded(
            cmd,
            Duration::from_millis(500),
            1_000,
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert_eq!(err, "shellout_tool_not_found");
    }

    #[test]
    fn canceled_child_is_killed() {
        if !has("sleep") {
            return;
        }
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err =
            run_status_bounded(cmd, Duration::from_secs(10), &cancel).unwrap_err();
        assert_eq!(err, "shellout_canceled");
    }

    #[test]
    fn timeout_kills_long_child() {
        if !has("sleep") {
            return;
        }
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let err = run_status_bounded(
            cmd,
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert_eq!(err, "shellout_timeout");
    }

    #[test]
    fn timeout_env_is_clamped() {
        assert_eq!(
            timeout_from_env_ms("RULECAST_NO_SUCH_ENV_KEY", 1_234),
            Duration::from_millis(1_234)
        );
    }
}
