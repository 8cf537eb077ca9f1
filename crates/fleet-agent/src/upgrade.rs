//! Self-Upgrade Executor (C5): download, verify, swap, and re-exec the
//! agent binary on command.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fleet_protocol::model::{UpgradeApply, UpgradeProgress, UpgradeResult, UpgradeStatus};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

pub async fn apply<F>(req: &UpgradeApply, mut on_progress: F) -> UpgradeResult
where
    F: FnMut(UpgradeProgress),
{
    match apply_inner(req, &mut on_progress).await {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "upgrade failed");
            UpgradeResult {
                status: UpgradeStatus::Failed,
                message: e.to_string(),
            }
        }
    }
}

async fn apply_inner<F>(req: &UpgradeApply, on_progress: &mut F) -> anyhow::Result<UpgradeResult>
where
    F: FnMut(UpgradeProgress),
{
    let current_exe = std::env::current_exe()?;
    let exe_dir = current_exe
        .parent()
        .ok_or_else(|| anyhow::anyhow!("executable has no parent directory"))?;
    let temp_path = exe_dir.join(format!(".fleetwatch-agent.{}.tmp", req.target_version));

    on_progress(UpgradeProgress {
        status: UpgradeStatus::Downloading,
        bytes_done: 0,
        bytes_total: None,
        message: format!("downloading {}", req.download_url),
    });

    download(&req.download_url, &temp_path, on_progress).await?;

    on_progress(UpgradeProgress {
        status: UpgradeStatus::Verifying,
        bytes_done: 0,
        bytes_total: None,
        message: "verifying sha256".to_string(),
    });

    let expected = normalize_sha256(&req.sha256);
    let actual = sha256_of_file(&temp_path).await?;
    if actual != expected {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Ok(UpgradeResult {
            status: UpgradeStatus::Failed,
            message: "sha256_mismatch".to_string(),
        });
    }

    on_progress(UpgradeProgress {
        status: UpgradeStatus::Applying,
        bytes_done: 0,
        bytes_total: None,
        message: "applying".to_string(),
    });

    preserve_executable_bit(&current_exe, &temp_path)?;
    apply_platform(&current_exe, &temp_path)?;

    Ok(UpgradeResult {
        status: UpgradeStatus::Succeeded,
        message: format!("upgraded to {}", req.target_version),
    })
}

async fn download<F>(url: &str, dest: &Path, on_progress: &mut F) -> anyhow::Result<()>
where
    F: FnMut(UpgradeProgress),
{
    use futures_util::StreamExt;
    use tokio::io::AsyncWriteExt;

    let resp = reqwest::get(url).await?.error_for_status()?;
    let total = resp.content_length();
    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = resp.bytes_stream();
    let mut downloaded = 0u64;
    let mut last_report = Instant::now();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        if last_report.elapsed() >= PROGRESS_INTERVAL {
            on_progress(UpgradeProgress {
                status: UpgradeStatus::Downloading,
                bytes_done: downloaded,
                bytes_total: total,
                message: "downloading".to_string(),
            });
            last_report = Instant::now();
        }
    }
    file.flush().await?;
    Ok(())
}

async fn sha256_of_file(path: &Path) -> anyhow::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

fn normalize_sha256(s: &str) -> String {
    s.trim()
        .strip_prefix("sha256:")
        .unwrap_or(s.trim())
        .to_lowercase()
}

#[cfg(unix)]
fn preserve_executable_bit(current_exe: &Path, temp_path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(current_exe)?.permissions().mode();
    let mut perms = std::fs::metadata(temp_path)?.permissions();
    perms.set_mode(mode);
    std::fs::set_permissions(temp_path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn preserve_executable_bit(_current_exe: &Path, _temp_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

/// Unix: atomic rename over the running executable, then re-exec with the
/// original argv/envp. Windows-like platforms cannot overwrite their own
/// running executable, so the new binary is staged alongside a marker file
/// for an external updater helper (documented decision, see DESIGN.md).
#[cfg(unix)]
fn apply_platform(current_exe: &Path, temp_path: &Path) -> anyhow::Result<()> {
    let backup = current_exe.with_extension("bak");
    let _ = std::fs::copy(current_exe, &backup);
    std::fs::rename(temp_path, current_exe)?;
    info!(path = %current_exe.display(), "binary replaced, re-exec pending");
    reexec(current_exe)
}

#[cfg(unix)]
fn reexec(current_exe: &Path) -> anyhow::Result<()> {
    use std::os::unix::process::CommandExt;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let err = std::process::Command::new(current_exe).args(&args).exec();
    Err(anyhow::anyhow!("re-exec failed: {err}"))
}

#[cfg(not(unix))]
fn apply_platform(current_exe: &Path, temp_path: &Path) -> anyhow::Result<()> {
    let staged = current_exe.with_extension("new");
    std::fs::rename(temp_path, &staged)?;
    let marker = current_exe.with_extension("upgrade-pending");
    std::fs::write(marker, staged.display().to_string())?;
    info!("staged upgrade for external updater helper, exiting");
    std::process::exit(0);
}

pub fn idempotence_window() -> Duration {
    fleet_protocol::constants::UPGRADE_IDEMPOTENCE_WINDOW
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_prefixed_uppercase_hash() {
        assert_eq!(
            normalize_sha256("sha256:ABCDEF"),
            "abcdef".to_string()
        );
        assert_eq!(normalize_sha256("abcdef"), "abcdef".to_string());
    }

    #[tokio::test]
    async fn sha256_mismatch_never_applies() {
        let dir = std::env::temp_dir().join(format!("fw-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("payload.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let digest = sha256_of_file(&path).await.unwrap();
        assert_ne!(digest, "deadbeef");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
