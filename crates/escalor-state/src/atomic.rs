use escalor_core::{EscalorError, EscalorResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Serialize `value` as pretty JSON and publish it at `path` atomically.
///
/// Writes a hidden `.{name}.tmp` sibling first and renames it into place.
/// Readers observe either the previous snapshot or the new one, never a
/// partial write.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> EscalorResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| EscalorError::State(format!("invalid state path '{}'", path.display())))?;
    let tmp_path = parent.join(format!(".{file_name}.tmp"));

    let json = serde_json::to_string_pretty(value)?;
    tokio::fs::write(&tmp_path, json).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Read a JSON state file.
///
/// A missing file is `Ok(None)`. A file that exists but does not parse is a
/// [`EscalorError::State`] error: the engine refuses to fabricate fresh
/// state over something it cannot read.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> EscalorResult<Option<T>> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value = serde_json::from_str(&text)
        .map_err(|e| EscalorError::State(format!("corrupt state file '{}': {e}", path.display())))?;
    Ok(Some(value))
}
