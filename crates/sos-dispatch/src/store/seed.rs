use std::path::Path;

use anyhow::Context;
use sos_protocol::Volunteer;
use tracing::info;

use super::Records;

/// Load a JSON array of volunteers into the store. Returns how many were
/// inserted.
pub async fn load_volunteers(records: &Records, path: impl AsRef<Path>) -> anyhow::Result<usize> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read seed file {}", path.display()))?;
    let volunteers: Vec<Volunteer> = serde_json::from_str(&raw)
        .with_context(|| format!("invalid volunteer seed file {}", path.display()))?;

    for volunteer in &volunteers {
        records.insert_volunteer(volunteer).await?;
    }

    info!(count = volunteers.len(), path = %path.display(), "seeded volunteers");
    Ok(volunteers.len())
}
