use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs::File;
use uuid::Uuid;

/// Something an SFTP handle string refers to
#[derive(Debug)]
pub enum OpenHandle {
    /// Open file, positioned per request
    File { path: PathBuf, file: File },
    /// Directory listing, served in one batch
    Dir { path: PathBuf, read_done: bool },
}

/// Handles of one SFTP session
#[derive(Debug, Default)]
pub struct HandleTable {
    handles: HashMap<String, OpenHandle>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn generate_handle() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn insert_file(&mut self, path: PathBuf, file: File) -> String {
        let handle = Self::generate_handle();
        self.handles
            .insert(handle.clone(), OpenHandle::File { path, file });
        handle
    }

    pub fn insert_dir(&mut self, path: PathBuf) -> String {
        let handle = Self::generate_handle();
        self.handles.insert(
            handle.clone(),
            OpenHandle::Dir {
                path,
                read_done: false,
            },
        );
        handle
    }

    pub fn get_mut(&mut self, handle: &str) -> Option<&mut OpenHandle> {
        self.handles.get_mut(handle)
    }

    pub fn remove(&mut self, handle: &str) -> Option<OpenHandle> {
        self.handles.remove(handle)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_unique_and_removable() {
        let mut table = HandleTable::new();
        let a = table.insert_dir(PathBuf::from("/tmp"));
        let b = table.insert_dir(PathBuf::from("/tmp"));
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);

        assert!(matches!(
            table.remove(&a),
            Some(OpenHandle::Dir { read_done: false, .. })
        ));
        assert!(table.remove(&a).is_none());
        assert!(table.get_mut(&b).is_some());
    }
}
