use anyhow::Context;

/// Running kernel's release string, e.g. `6.1.0-13-amd64`.
pub fn kernel_release() -> anyhow::Result<String> {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .context("failed to read kernel release")?;
    Ok(release.trim().to_string())
}
