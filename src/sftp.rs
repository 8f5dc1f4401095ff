use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tokio::fs::{File as FsFile, OpenOptions, ReadDir};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::debug;

// Largest read the server will answer in one SSH_FXP_READ.
const MAX_READ_LENGTH: usize = 261_120;

// Run the SFTP protocol engine over a session channel stream until the
// client disconnects or fails.
pub(crate) async fn serve<S>(stream: S)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    russh_sftp::server::run(stream, SftpSession::default()).await;
}

enum OpenHandle {
    File(FsFile),
    // The reader is dropped once the directory is exhausted so that
    // subsequent readdir calls answer EOF.
    Dir(Option<ReadDir>),
}

// One SFTP session, serving the process's view of the filesystem.
#[derive(Default)]
struct SftpSession {
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
}

impl SftpSession {
    fn register(&mut self, handle: OpenHandle) -> String {
        self.next_handle += 1;
        let key = self.next_handle.to_string();
        self.handles.insert(key.clone(), handle);
        key
    }

    fn file_mut(&mut self, handle: &str) -> Result<&mut FsFile, StatusCode> {
        match self.handles.get_mut(handle) {
            Some(OpenHandle::File(file)) => Ok(file),
            _ => Err(StatusCode::Failure),
        }
    }
}

fn status_code(error: &std::io::Error) -> StatusCode {
    match error.kind() {
        std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

fn ok_status(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

// Resolve an SFTP path to an absolute, dot-free one without touching the
// filesystem; realpath must also succeed for paths that do not exist yet.
fn absolute(path: &str) -> PathBuf {
    let path = Path::new(path);
    let mut resolved = if path.is_absolute() {
        PathBuf::new()
    } else {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
    };
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            component => resolved.push(component),
        }
    }
    if resolved.as_os_str().is_empty() {
        PathBuf::from("/")
    } else {
        resolved
    }
}

impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        debug!(version, ?extensions, "SFTP session initialized.");
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let mut options = OpenOptions::new();
        options
            .read(pflags.contains(OpenFlags::READ))
            .write(pflags.contains(OpenFlags::WRITE))
            .append(pflags.contains(OpenFlags::APPEND))
            .create(pflags.contains(OpenFlags::CREATE))
            .truncate(pflags.contains(OpenFlags::TRUNCATE));
        if pflags.contains(OpenFlags::EXCLUDE) {
            options.create_new(true);
        }
        let file = options
            .open(&filename)
            .await
            .map_err(|error| status_code(&error))?;
        Ok(Handle {
            id,
            handle: self.register(OpenHandle::File(file)),
        })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        match self.handles.remove(&handle) {
            Some(_) => Ok(ok_status(id)),
            None => Err(StatusCode::Failure),
        }
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let file = self.file_mut(&handle)?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|error| status_code(&error))?;
        let mut data = vec![0u8; (len as usize).min(MAX_READ_LENGTH)];
        let n = file
            .read(&mut data)
            .await
            .map_err(|error| status_code(&error))?;
        if n == 0 {
            return Err(StatusCode::Eof);
        }
        data.truncate(n);
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let file = self.file_mut(&handle)?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|error| status_code(&error))?;
        file.write_all(&data)
            .await
            .map_err(|error| status_code(&error))?;
        Ok(ok_status(id))
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let metadata = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|error| status_code(&error))?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let file = self.file_mut(&handle)?;
        let metadata = file
            .metadata()
            .await
            .map_err(|error| status_code(&error))?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        if let Some(size) = attrs.size {
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(|error| status_code(&error))?;
            file.set_len(size)
                .await
                .map_err(|error| status_code(&error))?;
        }
        #[cfg(unix)]
        if let Some(permissions) = attrs.permissions {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(permissions))
                .await
                .map_err(|error| status_code(&error))?;
        }
        Ok(ok_status(id))
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        handle: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let file = self.file_mut(&handle)?;
        if let Some(size) = attrs.size {
            file.set_len(size)
                .await
                .map_err(|error| status_code(&error))?;
        }
        Ok(ok_status(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let entries = tokio::fs::read_dir(&path)
            .await
            .map_err(|error| status_code(&error))?;
        Ok(Handle {
            id,
            handle: self.register(OpenHandle::Dir(Some(entries))),
        })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let Some(OpenHandle::Dir(entries)) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::Failure);
        };
        let Some(reader) = entries.as_mut() else {
            return Err(StatusCode::Eof);
        };
        let mut files = Vec::new();
        while files.len() < 64 {
            match reader.next_entry().await {
                Ok(Some(entry)) => {
                    let attrs = match entry.metadata().await {
                        Ok(metadata) => FileAttributes::from(&metadata),
                        Err(_) => FileAttributes::default(),
                    };
                    files.push(File::new(
                        entry.file_name().to_string_lossy().to_string(),
                        attrs,
                    ));
                }
                Ok(None) => {
                    *entries = None;
                    break;
                }
                Err(error) => {
                    debug!(%error, "Failed to read directory entry.");
                    *entries = None;
                    break;
                }
            }
        }
        if files.is_empty() {
            return Err(StatusCode::Eof);
        }
        Ok(Name { id, files })
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        tokio::fs::remove_file(&filename)
            .await
            .map_err(|error| status_code(&error))?;
        Ok(ok_status(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        tokio::fs::create_dir(&path)
            .await
            .map_err(|error| status_code(&error))?;
        Ok(ok_status(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        tokio::fs::remove_dir(&path)
            .await
            .map_err(|error| status_code(&error))?;
        Ok(ok_status(id))
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let resolved = absolute(&path);
        Ok(Name {
            id,
            files: vec![File::dummy(resolved.to_string_lossy().to_string())],
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|error| status_code(&error))?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        tokio::fs::rename(&oldpath, &newpath)
            .await
            .map_err(|error| status_code(&error))?;
        Ok(ok_status(id))
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let target = tokio::fs::read_link(&path)
            .await
            .map_err(|error| status_code(&error))?;
        Ok(Name {
            id,
            files: vec![File::dummy(target.to_string_lossy().to_string())],
        })
    }

    async fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> Result<Status, Self::Error> {
        #[cfg(unix)]
        {
            tokio::fs::symlink(&targetpath, &linkpath)
                .await
                .map_err(|error| status_code(&error))?;
            Ok(ok_status(id))
        }
        #[cfg(not(unix))]
        {
            let _ = (id, linkpath, targetpath);
            Err(StatusCode::OpUnsupported)
        }
    }
}

#[cfg(test)]
mod sftp_tests {
    use super::absolute;

    #[test]
    fn normalizes_absolute_paths() {
        assert_eq!(absolute("/a/b/../c").to_str(), Some("/a/c"));
        assert_eq!(absolute("/./x/.").to_str(), Some("/x"));
        assert_eq!(absolute("/..").to_str(), Some("/"));
    }

    #[test]
    fn resolves_relative_paths_under_the_working_directory() {
        let resolved = absolute("some/dir");
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("some/dir"));
    }

    #[test]
    fn empty_path_resolves_to_the_working_directory() {
        assert_eq!(absolute(""), std::env::current_dir().unwrap());
    }
}
