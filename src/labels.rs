// src/labels.rs - Class index <-> sign label mapping
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::Path;

use crate::error::LabelError;

#[derive(Deserialize)]
#[serde(untagged)]
enum MappingFile {
    Plain(Vec<String>),
    Indexed {
        index_to_class: BTreeMap<String, String>,
        #[serde(default)]
        class_to_index: Option<HashMap<String, usize>>,
    },
}

#[derive(Serialize)]
struct MappingOut<'a> {
    index_to_class: BTreeMap<String, &'a str>,
    class_to_index: BTreeMap<&'a str, usize>,
    num_classes: usize,
}

/// Bijective map between classifier output indices and sign labels.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassLabelMap {
    labels: Vec<String>,
    index: HashMap<String, usize>,
}

impl ClassLabelMap {
    pub fn from_labels(labels: Vec<String>) -> Result<Self, LabelError> {
        if labels.is_empty() {
            return Err(LabelError::Empty);
        }
        let mut index = HashMap::with_capacity(labels.len());
        for (i, label) in labels.iter().enumerate() {
            if let Some(first) = index.insert(label.clone(), i) {
                return Err(LabelError::DuplicateLabel {
                    label: label.clone(),
                    first,
                    second: i,
                });
            }
        }
        Ok(Self { labels, index })
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, LabelError> {
        let file = File::open(path.as_ref())?;
        let raw: MappingFile = serde_json::from_reader(std::io::BufReader::new(file))?;
        Self::from_mapping(raw)
    }

    pub fn from_json_str(json: &str) -> Result<Self, LabelError> {
        Self::from_mapping(serde_json::from_str(json)?)
    }

    fn from_mapping(raw: MappingFile) -> Result<Self, LabelError> {
        let (index_to_class, class_to_index) = match raw {
            MappingFile::Plain(labels) => return Self::from_labels(labels),
            MappingFile::Indexed {
                index_to_class,
                class_to_index,
            } => (index_to_class, class_to_index),
        };

        let mut by_index = BTreeMap::new();
        for (key, label) in index_to_class {
            let i: usize = key
                .trim()
                .parse()
                .map_err(|_| LabelError::BadIndex(key.clone()))?;
            // "0" and "00" name the same class
            if by_index.insert(i, label).is_some() {
                return Err(LabelError::BadIndex(key));
            }
        }
        // indices must run 0..N with no holes
        for (expected, i) in by_index.keys().enumerate() {
            if *i != expected {
                return Err(LabelError::Gap(expected));
            }
        }

        let map = Self::from_labels(by_index.into_values().collect())?;

        if let Some(reverse) = class_to_index {
            for (label, i) in &reverse {
                if map.index_of(label) != Some(*i) {
                    return Err(LabelError::Inconsistent(label.clone()));
                }
            }
            if reverse.len() != map.len() {
                return Err(LabelError::Inconsistent(format!(
                    "{} reverse entries for {} classes",
                    reverse.len(),
                    map.len()
                )));
            }
        }
        Ok(map)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<(), LabelError> {
        let out = MappingOut {
            index_to_class: self
                .labels
                .iter()
                .enumerate()
                .map(|(i, l)| (i.to_string(), l.as_str()))
                .collect(),
            class_to_index: self
                .labels
                .iter()
                .enumerate()
                .map(|(i, l)| (l.as_str(), i))
                .collect(),
            num_classes: self.labels.len(),
        };
        let file = File::create(path.as_ref())?;
        serde_json::to_writer_pretty(file, &out)?;
        Ok(())
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.index.get(label).copied()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexed_mapping_with_string_keys() {
        let map = ClassLabelMap::from_json_str(
            r#"{"index_to_class": {"1": "ধন্যবাদ", "0": "আমি", "2": "বাড়ি"},
                "class_to_index": {"আমি": 0, "ধন্যবাদ": 1, "বাড়ি": 2}}"#,
        )
        .unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.label(1), Some("ধন্যবাদ"));
        assert_eq!(map.index_of("বাড়ি"), Some(2));
        assert_eq!(map.label(3), None);
    }

    #[test]
    fn plain_array_is_accepted() {
        let map = ClassLabelMap::from_json_str(r#"["a", "b"]"#).unwrap();
        assert_eq!(map.index_of("b"), Some(1));
    }

    #[test]
    fn mapping_must_be_a_bijection() {
        let gap = ClassLabelMap::from_json_str(r#"{"index_to_class": {"0": "a", "2": "b"}}"#);
        assert!(matches!(gap, Err(LabelError::Gap(1))));

        let dup = ClassLabelMap::from_json_str(r#"{"index_to_class": {"0": "a", "1": "a"}}"#);
        assert!(matches!(dup, Err(LabelError::DuplicateLabel { .. })));

        let bad_key = ClassLabelMap::from_json_str(r#"{"index_to_class": {"zero": "a"}}"#);
        assert!(matches!(bad_key, Err(LabelError::BadIndex(_))));

        let repeated = ClassLabelMap::from_json_str(r#"{"index_to_class": {"0": "a", "00": "b", "1": "c"}}"#);
        assert!(matches!(repeated, Err(LabelError::BadIndex(_))));

        let inconsistent = ClassLabelMap::from_json_str(
            r#"{"index_to_class": {"0": "a", "1": "b"}, "class_to_index": {"a": 1, "b": 0}}"#,
        );
        assert!(matches!(inconsistent, Err(LabelError::Inconsistent(_))));

        assert!(matches!(ClassLabelMap::from_labels(Vec::new()), Err(LabelError::Empty)));
    }

    #[test]
    fn saved_mapping_loads_back() {
        let path = std::env::temp_dir().join(format!("labels_{}.json", uuid::Uuid::new_v4()));
        let map = ClassLabelMap::from_labels(vec!["x".into(), "y".into(), "z".into()]).unwrap();
        map.save_json(&path).unwrap();
        assert_eq!(ClassLabelMap::load_json(&path).unwrap(), map);
        let _ = std::fs::remove_file(&path);
    }
}
