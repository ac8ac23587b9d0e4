use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::CompoundName;
use crate::error::DockError;
use crate::store::StageWriter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T> {
    pub index: usize,
    pub items: Vec<T>,
}

impl<T> Batch<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub fn chunk<T: Clone>(items: &[T], size: usize) -> Result<Vec<Batch<T>>, DockError> {
    if size == 0 {
        return Err(DockError::InvalidBatchSize(size));
    }
    Ok(items
        .chunks(size)
        .enumerate()
        .map(|(index, items)| Batch {
            index: index + 1,
            items: items.to_vec(),
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchManifest {
    pub index: usize,
    pub names: Vec<CompoundName>,
    pub paths: Vec<Utf8PathBuf>,
}

impl BatchManifest {
    pub fn file_name(&self) -> String {
        manifest_file_name(self.index)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for path in &self.paths {
            out.push_str(path.as_str());
            out.push('\n');
        }
        out
    }
}

pub fn manifest_file_name(index: usize) -> String {
    format!("batch_{index}.txt")
}

pub fn write_manifests(
    writer: &StageWriter,
    names: &[CompoundName],
    artifact_dir: &Utf8Path,
    artifact_suffix: &str,
    size: usize,
) -> Result<Vec<BatchManifest>, DockError> {
    let mut sorted = names.to_vec();
    sorted.sort();
    let manifests: Vec<BatchManifest> = chunk(&sorted, size)?
        .into_iter()
        .map(|batch| BatchManifest {
            index: batch.index,
            paths: batch
                .items
                .iter()
                .map(|name| artifact_dir.join(format!("{}{artifact_suffix}", name.as_str())))
                .collect(),
            names: batch.items,
        })
        .collect();
    for manifest in &manifests {
        writer.write_side_file(&manifest.file_name(), manifest.render().as_bytes())?;
    }
    Ok(manifests)
}
