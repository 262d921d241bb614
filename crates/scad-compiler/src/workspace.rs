use std::io;
use std::path::{Path, PathBuf};

use scad_mesh::MeshFormat;
use uuid::Uuid;

const SCRIPT_FILE: &str = "model.scad";
const OUTPUT_STEM: &str = "model";

/// Directory owned by a single compile request.
///
/// Every request gets `<work_dir>/<uuid>/`, so concurrent sessions never
/// touch each other's script or mesh files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestWorkspace {
    id: Uuid,
    dir: PathBuf,
}

impl RequestWorkspace {
    pub async fn create(work_dir: &Path) -> io::Result<Self> {
        tokio::fs::create_dir_all(work_dir).await?;
        let id = Uuid::new_v4();
        let dir = work_dir.join(id.to_string());
        // create_dir (not create_dir_all) fails if the name is somehow taken.
        tokio::fs::create_dir(&dir).await?;
        Ok(Self { id, dir })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn script_path(&self) -> PathBuf {
        self.dir.join(SCRIPT_FILE)
    }

    pub fn output_path(&self, format: MeshFormat) -> PathBuf {
        self.dir
            .join(format!("{OUTPUT_STEM}.{}", format.extension()))
    }

    pub async fn write_script(&self, source: &str) -> io::Result<PathBuf> {
        let path = self.script_path();
        tokio::fs::write(&path, source).await?;
        Ok(path)
    }

    pub async fn remove_script(&self) -> io::Result<()> {
        match tokio::fs::remove_file(self.script_path()).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    /// Deletes the directory and everything in it. Missing directories are
    /// not an error.
    pub async fn remove(&self) -> io::Result<()> {
        remove_dir(&self.dir).await
    }
}

/// Removes request directories (`<work_dir>/<uuid>/`) left behind by an
/// earlier process. Anything not named like a request is left alone.
pub async fn sweep_work_dir(work_dir: &Path) -> io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(work_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let is_request = entry
            .file_name()
            .to_str()
            .is_some_and(|name| Uuid::parse_str(name).is_ok());
        if is_request && entry.file_type().await?.is_dir() {
            remove_dir(&entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

pub(crate) async fn remove_dir(dir: &Path) -> io::Result<()> {
    ignore_missing(tokio::fs::remove_dir_all(dir).await)
}

pub(crate) fn remove_dir_blocking(dir: &Path) -> io::Result<()> {
    ignore_missing(std::fs::remove_dir_all(dir))
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
