//! Task files on disk and the directories mined output goes to.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use webmcts_core::{Error, Result};

use crate::tree::SearchTree;

/// A search task; after a search `trace` holds the serialized tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFile {
    pub intent: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sites: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Value>,
    /// Unknown fields are carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskFile {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| Error::Store(format!("{}: {e}", path.display())))?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Store(format!("{}: {e}", path.display())))
    }

    /// The searched tree, if this task has been searched.
    pub fn tree(&self) -> Result<Option<SearchTree>> {
        match &self.trace {
            None | Some(Value::Null) => Ok(None),
            Some(v) => SearchTree::from_json(v).map(Some),
        }
    }

    pub fn set_tree(&mut self, tree: &SearchTree) -> Result<()> {
        self.trace = Some(tree.to_json()?);
        Ok(())
    }
}

/// Pretty-printed JSON, creating parent directories as needed.
pub fn write_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| Error::Store(e.to_string()))?;
    }
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| Error::Store(e.to_string()))?;
    fs::write(path, bytes).map_err(|e| Error::Store(format!("{}: {e}", path.display())))
}

#[derive(Debug, Clone)]
pub struct TaskStore {
    data_dir: PathBuf,
    valuable_dir: PathBuf,
    traceable_dir: PathBuf,
    reflection_dir: Option<PathBuf>,
}

impl TaskStore {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        valuable_dir: impl Into<PathBuf>,
        traceable_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            valuable_dir: valuable_dir.into(),
            traceable_dir: traceable_dir.into(),
            reflection_dir: None,
        }
    }

    pub fn with_reflection_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reflection_dir = Some(dir.into());
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// `*.json` files directly under the data directory, sorted by name.
    pub fn task_files(&self) -> Result<Vec<PathBuf>> {
        let rd = fs::read_dir(&self.data_dir)
            .map_err(|e| Error::Store(format!("{}: {e}", self.data_dir.display())))?;
        let mut out = Vec::new();
        for entry in rd {
            let path = entry.map_err(|e| Error::Store(e.to_string()))?.path();
            if path.is_file() && path.extension().is_some_and(|x| x == "json") {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    /// A task is finished once either output file exists.
    pub fn is_finished(&self, file_name: &str) -> bool {
        self.valuable_dir.join(file_name).exists() || self.traceable_dir.join(file_name).exists()
    }

    pub fn write_valuable<T: Serialize>(&self, file_name: &str, records: &[T]) -> Result<PathBuf> {
        let p = self.valuable_dir.join(file_name);
        write_json_pretty(&p, records)?;
        Ok(p)
    }

    pub fn write_traceable<T: Serialize>(&self, file_name: &str, records: &[T]) -> Result<PathBuf> {
        let p = self.traceable_dir.join(file_name);
        write_json_pretty(&p, records)?;
        Ok(p)
    }

    /// `None` when no reflection directory is configured.
    pub fn write_reflection<T: Serialize>(
        &self,
        file_name: &str,
        records: &[T],
    ) -> Result<Option<PathBuf>> {
        let Some(dir) = &self.reflection_dir else {
            return Ok(None);
        };
        let p = dir.join(file_name);
        write_json_pretty(&p, records)?;
        Ok(Some(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::SearchNode;

    #[test]
    fn scan_sees_only_json_files() {
        let td = tempfile::tempdir().unwrap();
        let data = td.path().join("data");
        fs::create_dir_all(data.join("nested.json")).unwrap();
        fs::write(data.join("b.json"), "{}").unwrap();
        fs::write(data.join("a.json"), "{}").unwrap();
        fs::write(data.join("notes.txt"), "x").unwrap();
        let store = TaskStore::new(&data, td.path().join("v"), td.path().join("t"));
        let names: Vec<_> = store
            .task_files()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.json", "b.json"]);
    }

    #[test]
    fn finished_when_either_output_exists() {
        let td = tempfile::tempdir().unwrap();
        let store = TaskStore::new(td.path(), td.path().join("v"), td.path().join("t"));
        assert!(!store.is_finished("x.json"));
        store.write_traceable("x.json", &[serde_json::json!({"k": 1})]).unwrap();
        assert!(store.is_finished("x.json"));
        assert!(!store.is_finished("y.json"));
        assert!(store.write_reflection("x.json", &[1]).unwrap().is_none());
    }

    #[test]
    fn task_file_keeps_unknown_fields_and_embeds_tree() {
        let td = tempfile::tempdir().unwrap();
        let p = td.path().join("task.json");
        fs::write(
            &p,
            r#"{"task_id": 7, "intent": "buy shoes", "state": "[1] RootWebArea 'x'", "sites": ["shopping"]}"#,
        )
        .unwrap();
        let mut task = TaskFile::load(&p).unwrap();
        assert!(task.tree().unwrap().is_none());
        assert_eq!(task.extra["task_id"], 7);

        let mut tree = SearchTree::new(task.state.clone());
        let root = tree.root();
        tree.add_child(root, SearchNode::new("click [1]", "[2] RootWebArea 'y'"));
        task.set_tree(&tree).unwrap();
        let out = td.path().join("out").join("task.json");
        write_json_pretty(&out, &task).unwrap();

        let back = TaskFile::load(&out).unwrap();
        assert_eq!(back.extra["task_id"], 7);
        let t = back.tree().unwrap().unwrap();
        assert_eq!(t.node_count(), 2);
    }
}
