//! On-disk outfit and FITB records.
//!
//! Dataset shards are JSON-lines files holding one record per line. Outfit
//! records carry either extracted feature vectors or raw image bytes for each
//! item; FITB records carry the context items, the candidate answers and the
//! index of the true answer among the candidates.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::fashion::error::{EncoderError, Result};

/// Per-item payload of an outfit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemContent {
    Features { features: Vec<Vec<f32>> },
    Images { images: Vec<Vec<u8>> },
}

impl ItemContent {
    pub fn len(&self) -> usize {
        match self {
            Self::Features { features } => features.len(),
            Self::Images { images } => images.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One outfit: parallel sequences of item ids, categories and contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutfitRecord {
    pub ids: Vec<i64>,
    pub categories: Vec<i64>,
    #[serde(flatten)]
    pub content: ItemContent,
}

impl OutfitRecord {
    pub fn with_features(ids: Vec<i64>, categories: Vec<i64>, features: Vec<Vec<f32>>) -> Self {
        Self {
            ids,
            categories,
            content: ItemContent::Features { features },
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Check that ids, categories and contents line up.
    pub fn validate(&self, index: usize) -> Result<()> {
        if self.ids.len() != self.categories.len() || self.ids.len() != self.content.len() {
            return Err(EncoderError::malformed(
                index,
                format!(
                    "{} ids, {} categories and {} items",
                    self.ids.len(),
                    self.categories.len(),
                    self.content.len()
                ),
            ));
        }
        Ok(())
    }
}

/// One Fill-In-The-Blank question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitbRecord {
    /// Context items of the outfit, with the answer removed
    pub inputs: Vec<Vec<f32>>,
    pub input_categories: Vec<i64>,
    /// Candidate answers
    pub targets: Vec<Vec<f32>>,
    pub target_categories: Vec<i64>,
    /// Index of the true answer among `targets`
    pub target_position: usize,
}

impl FitbRecord {
    pub fn validate(&self, index: usize) -> Result<()> {
        if self.inputs.len() != self.input_categories.len() {
            return Err(EncoderError::malformed(
                index,
                format!(
                    "{} inputs but {} input categories",
                    self.inputs.len(),
                    self.input_categories.len()
                ),
            ));
        }
        if self.targets.len() != self.target_categories.len() {
            return Err(EncoderError::malformed(
                index,
                format!(
                    "{} targets but {} target categories",
                    self.targets.len(),
                    self.target_categories.len()
                ),
            ));
        }
        if self.target_position >= self.targets.len() {
            return Err(EncoderError::malformed(
                index,
                format!(
                    "target_position {} outside {} candidates",
                    self.target_position,
                    self.targets.len()
                ),
            ));
        }
        Ok(())
    }
}

/// Read every record of a JSON-lines shard; blank lines are skipped.
pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|err| {
            EncoderError::malformed(line_no, format!("{}: {}", path.display(), err))
        })?;
        records.push(record);
    }

    log::debug!("read {} records from {}", records.len(), path.display());
    Ok(records)
}

/// Write records as a JSON-lines shard, replacing any existing file.
pub fn write_records<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_content_parses_both_layouts() {
        let with_features: OutfitRecord =
            serde_json::from_str(r#"{"ids":[1,2],"categories":[3,4],"features":[[0.5],[1.5]]}"#).unwrap();
        assert_eq!(
            with_features.content,
            ItemContent::Features {
                features: vec![vec![0.5], vec![1.5]]
            }
        );

        let with_images: OutfitRecord =
            serde_json::from_str(r#"{"ids":[1],"categories":[3],"images":[[255,216]]}"#).unwrap();
        assert!(matches!(with_images.content, ItemContent::Images { .. }));
    }

    #[test]
    fn test_validate_length_mismatch() {
        let record = OutfitRecord::with_features(vec![1, 2, 3], vec![4, 5], vec![vec![0.0]; 3]);
        assert!(matches!(
            record.validate(7),
            Err(EncoderError::MalformedRecord { index: 7, .. })
        ));
    }

    #[test]
    fn test_fitb_validate_target_position() {
        let record = FitbRecord {
            inputs: vec![vec![0.0; 2]],
            input_categories: vec![3],
            targets: vec![vec![1.0; 2], vec![2.0; 2]],
            target_categories: vec![4, 4],
            target_position: 2,
        };
        assert!(record.validate(0).is_err());
        assert!(FitbRecord { target_position: 1, ..record }.validate(0).is_ok());
    }

    #[test]
    fn test_read_reports_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"ids\":[1],\"categories\":[1],\"features\":[[1.0]]}\n\nnot json\n").unwrap();

        let err = read_records::<OutfitRecord>(&path).unwrap_err();
        assert!(matches!(err, EncoderError::MalformedRecord { index: 2, .. }));
    }
}
