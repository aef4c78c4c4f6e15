//! Open file registry
//!
//! Linear scan over a small vector; the file count is bounded by the
//! configured open-file limit. Two registered files must never resolve to
//! the same rendered path. That would mean two workers could hold an fd
//! for the same file, so a duplicate at insert is fatal to the node.

use std::sync::Arc;

use crate::file::AsyncFile;

#[derive(Debug, Default)]
pub(crate) struct OpenFiles {
    files: Vec<(u16, Arc<AsyncFile>)>,
}

impl OpenFiles {
    pub fn new() -> OpenFiles {
        OpenFiles { files: Vec::new() }
    }

    pub fn insert(&mut self, file: Arc<AsyncFile>, id: u16) {
        let name = file.filename();
        for (_, other) in &self.files {
            let other_name = other.filename();
            assert!(
                other_name.is_empty() || other_name.as_str() != name.as_str(),
                "open: >{}< is already open",
                name.as_str()
            );
        }
        self.files.push((id, file));
    }

    pub fn find(&self, id: u16) -> Option<Arc<AsyncFile>> {
        self.files
            .iter()
            .find(|(fid, _)| *fid == id)
            .map(|(_, f)| Arc::clone(f))
    }

    pub fn erase(&mut self, id: u16) {
        let pos = self
            .files
            .iter()
            .position(|(fid, _)| *fid == id)
            .unwrap_or_else(|| panic!("erase of unknown file handle {id}"));
        self.files.remove(pos);
    }

    pub fn size(&self) -> usize {
        self.files.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &Arc<AsyncFile>)> {
        self.files.iter().map(|(id, f)| (*id, f))
    }
}
