use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context as AnyhowContext;
use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::error::Result;
use crate::persistence::memento::{BrooklynObjectType, MementoRawData};
use crate::persistence::store::MementoStore;

const PLANE_ID_FILE: &str = "planeId";
const JAR_SUFFIX: &str = ".jar";
const TMP_SUFFIX: &str = ".tmp";

/// One directory per object type, one file per object.
///
/// ```text
/// <root>/planeId
/// <root>/entities/<id>
/// <root>/feeds/<id>
/// <root>/bundles/<id>  <root>/bundles/<id>.jar
/// ```
pub struct FileMementoStore {
    root: PathBuf,
}

impl FileMementoStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, kind: BrooklynObjectType, id: &str) -> PathBuf {
        self.root.join(kind.dir_name()).join(encode_id(id))
    }

    fn jar_path(&self, id: &str) -> PathBuf {
        self.root
            .join(BrooklynObjectType::ManagedBundle.dir_name())
            .join(format!("{}{}", encode_id(id), JAR_SUFFIX))
    }
}

/// Writes through a sibling temp file so readers never see a partial object.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension(match path.extension() {
        Some(ext) => format!("{}{}", ext.to_string_lossy(), TMP_SUFFIX),
        None => TMP_SUFFIX.trim_start_matches('.').to_string(),
    });
    fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
    }
}

async fn read_group(dir: &Path) -> anyhow::Result<(BTreeMap<String, String>, BTreeMap<String, Vec<u8>>)> {
    let mut texts = BTreeMap::new();
    let mut jars = BTreeMap::new();
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to list {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(TMP_SUFFIX) || name.starts_with('.') {
            continue;
        }
        if let Some(stem) = name.strip_suffix(JAR_SUFFIX) {
            let bytes = fs::read(entry.path()).await?;
            jars.insert(decode_id(stem), bytes);
        } else {
            let content = fs::read_to_string(entry.path())
                .await
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            texts.insert(decode_id(&name), content);
        }
    }
    Ok((texts, jars))
}

#[async_trait]
impl MementoStore for FileMementoStore {
    async fn load_raw_data(&self) -> Result<MementoRawData> {
        let mut raw = MementoRawData::new();
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            debug!(dir = %self.root.display(), "Memento directory does not exist; starting empty");
            return Ok(raw);
        }
        let plane_file = self.root.join(PLANE_ID_FILE);
        if fs::try_exists(&plane_file).await.unwrap_or(false) {
            let plane_id = fs::read_to_string(&plane_file)
                .await
                .context("Failed to read plane id")?;
            raw.plane_id = Some(plane_id.trim().to_string());
        }

        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("Failed to list {}", self.root.display()))?;
        while let Some(entry) = entries.next_entry().await.context("Failed to list memento dir")? {
            if !entry.file_type().await.context("Failed to stat memento dir")?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().into_owned();
            let (texts, jars) = read_group(&entry.path()).await?;
            match BrooklynObjectType::from_dir_name(&dir_name) {
                Some(kind) => {
                    for (id, content) in texts {
                        raw.put(kind, id, content);
                    }
                    if kind == BrooklynObjectType::ManagedBundle {
                        raw.bundle_jars.extend(jars);
                    }
                }
                None => {
                    if !texts.is_empty() {
                        raw.unknown.insert(dir_name, texts);
                    }
                }
            }
        }
        Ok(raw)
    }

    async fn write(&self, kind: BrooklynObjectType, id: &str, content: &str) -> Result<()> {
        write_atomic(&self.object_path(kind, id), content.as_bytes()).await?;
        Ok(())
    }

    async fn delete(&self, kind: BrooklynObjectType, id: &str) -> Result<()> {
        remove_if_exists(&self.object_path(kind, id)).await?;
        Ok(())
    }

    async fn write_bundle_jar(&self, id: &str, bytes: &[u8]) -> Result<()> {
        write_atomic(&self.jar_path(id), bytes).await?;
        Ok(())
    }

    async fn delete_bundle_jar(&self, id: &str) -> Result<()> {
        remove_if_exists(&self.jar_path(id)).await?;
        Ok(())
    }

    async fn write_plane_id(&self, plane_id: &str) -> Result<()> {
        write_atomic(&self.root.join(PLANE_ID_FILE), plane_id.as_bytes()).await?;
        Ok(())
    }
}

/// Ids may contain `:`, `/` or brackets (feed tags); keep file names portable.
/// `.` is always escaped so the `.jar` and `.tmp` suffixes belong to the store alone.
fn encode_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for b in id.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn decode_id(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(b) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_survive_file_name_encoding() {
        for id in [
            "abc123",
            "e1:HttpFeed[http://x/y:up]",
            ".hidden",
            "a.b-c_d",
            "ü",
            "notes.tmp",
            "bundle.jar",
        ] {
            let encoded = encode_id(id);
            assert!(!encoded.contains('/') && !encoded.contains('.'));
            assert_eq!(decode_id(&encoded), id);
        }
    }

    #[test]
    fn names_from_older_layout_still_decode() {
        assert_eq!(decode_id("a.b-c_d"), "a.b-c_d");
        assert_eq!(decode_id("e1%3Aload"), "e1:load");
    }
}
