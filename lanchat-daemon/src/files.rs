//! Blocking file access for transfers: source reads, `.part` sinks, final rename.
//! Called from `spawn_blocking`.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use lanchat_core::chunk::ChunkRange;
use lanchat_core::TransferId;
use tokio::sync::Mutex;

const PART_SUFFIX: &str = ".part";

/// Paths of the files behind every live transfer.
pub struct FileStore {
    download_dir: PathBuf,
    sources: Mutex<HashMap<TransferId, PathBuf>>,
    sinks: Mutex<HashMap<TransferId, Sink>>,
}

/// Destination of an incoming transfer.
#[derive(Debug, Clone)]
pub struct Sink {
    pub part: PathBuf,
    pub file_name: String,
}

impl FileStore {
    pub fn new(download_dir: PathBuf) -> Self {
        Self {
            download_dir,
            sources: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub async fn add_source(&self, id: TransferId, path: PathBuf) {
        self.sources.lock().await.insert(id, path);
    }

    pub async fn source(&self, id: &TransferId) -> Option<PathBuf> {
        self.sources.lock().await.get(id).cloned()
    }

    /// Forget the source of an outgoing transfer that has ended.
    pub async fn remove_source(&self, id: &TransferId) {
        self.sources.lock().await.remove(id);
    }

    pub async fn add_sink(&self, id: TransferId, sink: Sink) {
        self.sinks.lock().await.insert(id, sink);
    }

    pub async fn sink(&self, id: &TransferId) -> Option<Sink> {
        self.sinks.lock().await.get(id).cloned()
    }

    pub async fn take_sink(&self, id: &TransferId) -> Option<Sink> {
        self.sinks.lock().await.remove(id)
    }
}

/// Size of a regular file, or an error for directories and missing paths.
pub fn source_len(path: &Path) -> io::Result<u64> {
    let meta = fs::metadata(path)?;
    if !meta.is_file() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"));
    }
    Ok(meta.len())
}

/// Read exactly `range` from `path`.
pub fn read_chunk(path: &Path, range: ChunkRange) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(range.offset))?;
    let mut buf = vec![0u8; range.len as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Create an empty `.part` file for `file_name` in `dir`, never overwriting an existing one.
pub fn create_part(dir: &Path, file_name: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    for n in 0u32.. {
        let candidate = dir.join(format!("{}{}", numbered(file_name, n), PART_SUFFIX));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(io::ErrorKind::AlreadyExists, "no free file name"))
}

/// Write `payload` at `offset` of the part file.
pub fn write_chunk(part: &Path, offset: u64, payload: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(part)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(payload)?;
    file.sync_data()
}

/// Move a finished part file to `dir/file_name`, numbering the name if it is taken.
/// Existing files are never replaced: the final name is claimed with a hard link.
pub fn finish_part(part: &Path, dir: &Path, file_name: &str) -> io::Result<PathBuf> {
    for n in 0u32.. {
        let target = dir.join(numbered(file_name, n));
        match fs::hard_link(part, &target) {
            Ok(()) => {
                fs::remove_file(part)?;
                return Ok(target);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(io::ErrorKind::AlreadyExists, "no free file name"))
}

pub fn discard_part(part: &Path) -> io::Result<()> {
    match fs::remove_file(part) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// `report.pdf`, `report (1).pdf`, `report (2).pdf`, ...
fn numbered(file_name: &str, n: u32) -> String {
    if n == 0 {
        return file_name.to_string();
    }
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({n}).{ext}"),
        _ => format!("{file_name} ({n})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbering_keeps_extension() {
        assert_eq!(numbered("a.txt", 0), "a.txt");
        assert_eq!(numbered("a.txt", 2), "a (2).txt");
        assert_eq!(numbered("README", 1), "README (1)");
        assert_eq!(numbered(".bashrc", 1), ".bashrc (1)");
    }

    #[test]
    fn part_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let part = create_part(dir.path(), "notes.txt").unwrap();
        assert!(part.to_string_lossy().ends_with("notes.txt.part"));

        write_chunk(&part, 4, b"5678").unwrap();
        write_chunk(&part, 0, b"1234").unwrap();
        let done = finish_part(&part, dir.path(), "notes.txt").unwrap();
        assert_eq!(fs::read(&done).unwrap(), b"12345678");
        assert!(!part.exists());

        let part = create_part(dir.path(), "notes.txt").unwrap();
        let second = finish_part(&part, dir.path(), "notes.txt").unwrap();
        assert_eq!(second, dir.path().join("notes (1).txt"));
    }

    #[test]
    fn finish_never_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"keep").unwrap();
        fs::write(dir.path().join("a (1).txt"), b"keep too").unwrap();
        let part = create_part(dir.path(), "a.txt").unwrap();
        write_chunk(&part, 0, b"new").unwrap();

        let done = finish_part(&part, dir.path(), "a.txt").unwrap();
        assert_eq!(done, dir.path().join("a (2).txt"));
        assert_eq!(fs::read(&done).unwrap(), b"new");
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"keep");
        assert_eq!(fs::read(dir.path().join("a (1).txt")).unwrap(), b"keep too");
        assert!(!part.exists());
    }

    #[test]
    fn finish_reports_missing_part() {
        let dir = tempfile::tempdir().unwrap();
        let err = finish_part(&dir.path().join("gone.part"), dir.path(), "gone").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(!dir.path().join("gone").exists());
    }

    #[tokio::test]
    async fn sources_are_forgotten() {
        let store = FileStore::new(PathBuf::from("/tmp"));
        let id = TransferId::new();
        store.add_source(id, PathBuf::from("/tmp/x")).await;
        assert!(store.source(&id).await.is_some());
        store.remove_source(&id).await;
        assert!(store.source(&id).await.is_none());
    }

    #[test]
    fn concurrent_parts_get_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let a = create_part(dir.path(), "x.bin").unwrap();
        let b = create_part(dir.path(), "x.bin").unwrap();
        assert_ne!(a, b);
        discard_part(&a).unwrap();
        discard_part(&a).unwrap();
        assert!(!a.exists());
    }

    #[test]
    fn reads_exact_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        fs::write(&path, (0..50u8).collect::<Vec<_>>()).unwrap();
        assert_eq!(source_len(&path).unwrap(), 50);
        let range = ChunkRange {
            sequence: 1,
            offset: 16,
            len: 16,
        };
        assert_eq!(read_chunk(&path, range).unwrap(), (16..32u8).collect::<Vec<_>>());
        assert!(source_len(dir.path()).is_err());
    }
}
