use std::path::Path;

use anyhow::Context as _;
use goodable_core::request::RequestRecord;

pub const REQUESTS_FILE: &str = "requests.json";

pub async fn save_requests(runtime_dir: &Path, records: &[RequestRecord]) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(runtime_dir)
        .await
        .with_context(|| format!("create runtime dir: {}", runtime_dir.display()))?;

    let tmp = runtime_dir.join("requests.json.tmp");
    let dest = runtime_dir.join(REQUESTS_FILE);

    let data = serde_json::to_vec_pretty(records).context("serialize requests")?;

    tokio::fs::write(&tmp, &data)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, &dest)
        .await
        .with_context(|| format!("rename {} -> {}", tmp.display(), dest.display()))?;

    Ok(())
}

pub async fn load_requests(runtime_dir: &Path) -> anyhow::Result<Vec<RequestRecord>> {
    let path = runtime_dir.join(REQUESTS_FILE);
    let data = match tokio::fs::read_to_string(&path).await {
        Ok(s) => s,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    if data.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&data).with_context(|| format!("parse {}", path.display()))
}
