use crate::handle::{HandleTable, OpenHandle};
use chrono::{DateTime, Utc};
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use std::collections::HashMap;
use std::fs::{Metadata, Permissions};
use std::io::{self, SeekFrom};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

/// Largest chunk returned by a single read
const MAX_READ_LEN: u32 = 256 * 1024;

/// Convert filesystem metadata to russh_sftp FileAttributes
fn to_file_attributes(metadata: &Metadata) -> FileAttributes {
    FileAttributes {
        size: Some(metadata.len()),
        permissions: Some(metadata.mode()),
        mtime: Some(metadata.mtime() as u32),
        atime: Some(metadata.atime() as u32),
        uid: Some(metadata.uid()),
        gid: Some(metadata.gid()),
        ..Default::default()
    }
}

/// Map an I/O failure to the closest SFTP status
fn status_of(err: io::Error) -> StatusCode {
    match err.kind() {
        io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

fn ok_status(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en".to_string(),
    }
}

/// Lexically clean a path: drop `.`, resolve `..`, never climb above `/`
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

/// Resolve a client path against the working directory
pub fn resolve(working_dir: &Path, path: &str) -> PathBuf {
    if path.is_empty() {
        return normalize(working_dir);
    }
    normalize(&working_dir.join(path))
}

fn mode_string(mode: u32) -> String {
    let kind = match mode & 0o170000 {
        0o040000 => 'd',
        0o120000 => 'l',
        0o020000 => 'c',
        0o060000 => 'b',
        0o010000 => 'p',
        0o140000 => 's',
        _ => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// Older timestamps show the year instead of the time, as `ls -l` does
const RECENT_SECS: i64 = 31_556_952 / 2;

/// `Mon DD HH:MM` for recent timestamps, `Mon DD  YYYY` otherwise (UTC)
fn format_mtime(secs: i64, now: DateTime<Utc>) -> String {
    let mtime = DateTime::from_timestamp(secs, 0).unwrap_or_default();
    let age = now.signed_duration_since(mtime).num_seconds();
    if (0..RECENT_SECS).contains(&age) {
        mtime.format("%b %e %H:%M").to_string()
    } else {
        mtime.format("%b %e  %Y").to_string()
    }
}

/// `ls -l` style line for directory listings
pub fn long_name(name: &str, metadata: &Metadata) -> String {
    format!(
        "{} {:>4} {:<8} {:<8} {:>8} {} {}",
        mode_string(metadata.mode()),
        metadata.nlink(),
        metadata.uid(),
        metadata.gid(),
        metadata.len(),
        format_mtime(metadata.mtime(), Utc::now()),
        name
    )
}

/// SFTP session handler serving the local filesystem
///
/// Absolute paths are host paths; relative paths resolve against the
/// working directory.
pub struct FsHandler {
    working_dir: PathBuf,
    handles: HandleTable,
}

impl FsHandler {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            handles: HandleTable::new(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        resolve(&self.working_dir, path)
    }

    fn file(&mut self, handle: &str) -> Result<&mut fs::File, StatusCode> {
        match self.handles.get_mut(handle) {
            Some(OpenHandle::File { file, .. }) => Ok(file),
            _ => Err(StatusCode::Failure),
        }
    }
}

async fn apply_attrs(path: &Path, attrs: &FileAttributes) -> Result<(), StatusCode> {
    if let Some(size) = attrs.size {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(status_of)?;
        file.set_len(size).await.map_err(status_of)?;
    }
    if let Some(mode) = attrs.permissions {
        fs::set_permissions(path, Permissions::from_mode(mode & 0o7777))
            .await
            .map_err(status_of)?;
    }
    Ok(())
}

impl russh_sftp::server::Handler for FsHandler {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        debug!(version, "SFTP init");
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        debug!(id, path = %filename, ?pflags, "Opening file");
        let path = self.resolve(&filename);

        let write = pflags.contains(OpenFlags::WRITE);
        let append = pflags.contains(OpenFlags::APPEND);
        let mut options = fs::OpenOptions::new();
        options
            .read(pflags.contains(OpenFlags::READ) || !(write || append))
            .write(write)
            .append(append)
            .truncate(pflags.contains(OpenFlags::TRUNCATE));
        if pflags.contains(OpenFlags::CREATE) {
            if pflags.contains(OpenFlags::EXCLUDE) {
                options.create_new(true);
            } else {
                options.create(true);
            }
        }
        if let Some(mode) = attrs.permissions {
            options.mode(mode & 0o7777);
        }

        let file = options.open(&path).await.map_err(status_of)?;
        let handle = self.handles.insert_file(path, file);
        Ok(Handle { id, handle })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        debug!(id, handle = %handle, "Closing handle");

        match self.handles.remove(&handle) {
            Some(OpenHandle::File { path, mut file }) => {
                file.flush().await.map_err(status_of)?;
                debug!(path = %path.display(), "Closed file");
            }
            Some(OpenHandle::Dir { .. }) => {}
            None => return Err(StatusCode::Failure),
        }
        Ok(ok_status(id))
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        debug!(id, handle = %handle, offset, len, "Reading file");
        let file = self.file(&handle)?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(status_of)?;

        let mut data = vec![0u8; len.min(MAX_READ_LEN) as usize];
        let mut filled = 0;
        while filled < data.len() {
            let n = file.read(&mut data[filled..]).await.map_err(status_of)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 && !data.is_empty() {
            return Err(StatusCode::Eof);
        }
        data.truncate(filled);

        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        debug!(id, handle = %handle, offset, len = data.len(), "Writing file");
        let file = self.file(&handle)?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(status_of)?;
        file.write_all(&data).await.map_err(status_of)?;
        file.flush().await.map_err(status_of)?;

        Ok(ok_status(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        debug!(id, path = %path, "Opening directory");
        let path = self.resolve(&path);

        let metadata = fs::metadata(&path).await.map_err(status_of)?;
        if !metadata.is_dir() {
            return Err(StatusCode::NoSuchFile);
        }

        let handle = self.handles.insert_dir(path);
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        debug!(id, handle = %handle, "Reading directory");

        let path = match self.handles.get_mut(&handle) {
            Some(OpenHandle::Dir { path, read_done }) => {
                if *read_done {
                    return Err(StatusCode::Eof);
                }
                *read_done = true;
                path.clone()
            }
            _ => return Err(StatusCode::Failure),
        };

        let mut entries = fs::read_dir(&path).await.map_err(status_of)?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(status_of)? {
            // Entries may vanish while listing.
            let Ok(metadata) = fs::symlink_metadata(entry.path()).await else {
                continue;
            };
            let filename = entry.file_name().to_string_lossy().into_owned();
            files.push(File {
                longname: long_name(&filename, &metadata),
                attrs: to_file_attributes(&metadata),
                filename,
            });
        }

        Ok(Name { id, files })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        debug!(id, path = %path, "Getting file stats");
        let metadata = fs::metadata(self.resolve(&path))
            .await
            .map_err(status_of)?;

        Ok(Attrs {
            id,
            attrs: to_file_attributes(&metadata),
        })
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let metadata = fs::symlink_metadata(self.resolve(&path))
            .await
            .map_err(status_of)?;

        Ok(Attrs {
            id,
            attrs: to_file_attributes(&metadata),
        })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let metadata = match self.handles.get_mut(&handle) {
            Some(OpenHandle::File { file, .. }) => file.metadata().await,
            Some(OpenHandle::Dir { path, .. }) => fs::metadata(&*path).await,
            None => return Err(StatusCode::Failure),
        }
        .map_err(status_of)?;

        Ok(Attrs {
            id,
            attrs: to_file_attributes(&metadata),
        })
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        debug!(id, path = %path, "Setting file stats");
        apply_attrs(&self.resolve(&path), &attrs).await?;
        Ok(ok_status(id))
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        handle: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let file = self.file(&handle)?;
        if let Some(size) = attrs.size {
            file.set_len(size).await.map_err(status_of)?;
        }
        if let Some(mode) = attrs.permissions {
            file.set_permissions(Permissions::from_mode(mode & 0o7777))
                .await
                .map_err(status_of)?;
        }
        Ok(ok_status(id))
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let absolute = self.resolve(&path).to_string_lossy().into_owned();

        Ok(Name {
            id,
            files: vec![File::dummy(&absolute)],
        })
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        debug!(id, path = %path, "Creating directory");
        let mode = attrs.permissions.unwrap_or(0o777) & 0o7777;
        fs::DirBuilder::new()
            .mode(mode)
            .create(self.resolve(&path))
            .await
            .map_err(status_of)?;

        Ok(ok_status(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        debug!(id, path = %path, "Removing directory");
        fs::remove_dir(self.resolve(&path))
            .await
            .map_err(status_of)?;

        Ok(ok_status(id))
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        debug!(id, path = %filename, "Removing file");
        fs::remove_file(self.resolve(&filename))
            .await
            .map_err(status_of)?;

        Ok(ok_status(id))
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        debug!(id, from = %oldpath, to = %newpath, "Renaming");
        fs::rename(self.resolve(&oldpath), self.resolve(&newpath))
            .await
            .map_err(status_of)?;

        Ok(ok_status(id))
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let target = fs::read_link(self.resolve(&path))
            .await
            .map_err(status_of)?;
        let target = target.to_string_lossy().into_owned();

        Ok(Name {
            id,
            files: vec![File::dummy(&target)],
        })
    }

    async fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> Result<Status, Self::Error> {
        debug!(id, link = %linkpath, target = %targetpath, "Creating symlink");
        fs::symlink(&targetpath, self.resolve(&linkpath))
            .await
            .map_err(status_of)?;

        Ok(ok_status(id))
    }
}
