//! Chunked file storage on the context's document store.
//!
//! Files live in the configured file-store database as one `fs_files` row
//! plus numbered `fs_chunks` rows. Several files may share a filename; the
//! newest upload is the "last version". Content can be LZ4 compressed on
//! write; the `compressed` metadata key marks it so reads restore the
//! original bytes.

use crate::context::ResourceContext;
use crate::error::{Error, Result};
use crate::metrics::{FILES_DELETED, FILES_GET, FILES_PUT};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::str::FromStr;
use std::sync::LazyLock;
use ulid::{Generator, Ulid};

/// Metadata key flagging compressed content.
pub const COMPRESSED_KEY: &str = "compressed";

/// Caller supplied metadata stored alongside a file.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS fs_files (
    id TEXT PRIMARY KEY,
    filename TEXT NOT NULL,
    length INTEGER NOT NULL,
    chunk_size INTEGER NOT NULL,
    upload_date TEXT NOT NULL,
    sha256 TEXT NOT NULL,
    metadata TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_fs_files_filename ON fs_files(filename, upload_date);
CREATE TABLE IF NOT EXISTS fs_chunks (
    file_id TEXT NOT NULL REFERENCES fs_files(id) ON DELETE CASCADE,
    n INTEGER NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (file_id, n)
);
";

const SELECT_INFO: &str =
    "SELECT id, filename, length, chunk_size, upload_date, sha256, metadata FROM fs_files";

/// Ids are generated monotonically so uploads within one millisecond still
/// sort in upload order.
static IDS: LazyLock<Mutex<Generator>> = LazyLock::new(|| Mutex::new(Generator::new()));

/// Identifier assigned to a stored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(Ulid);

impl FileId {
    fn generate() -> Self {
        let mut ids = IDS.lock();
        FileId(ids.generate().unwrap_or_else(|_| Ulid::new()))
    }

    /// Time the id was generated.
    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.0.datetime())
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for FileId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s.trim())
            .map(FileId)
            .map_err(|e| Error::InvalidId(format!("{s:?}: {e}")))
    }
}

impl Serialize for FileId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Values accepted where a file id is expected.
pub trait IntoFileId {
    fn into_file_id(self) -> Result<FileId>;
}

impl IntoFileId for FileId {
    fn into_file_id(self) -> Result<FileId> {
        Ok(self)
    }
}

impl IntoFileId for &FileId {
    fn into_file_id(self) -> Result<FileId> {
        Ok(*self)
    }
}

impl IntoFileId for &str {
    fn into_file_id(self) -> Result<FileId> {
        self.parse()
    }
}

impl IntoFileId for String {
    fn into_file_id(self) -> Result<FileId> {
        self.parse()
    }
}

impl IntoFileId for &String {
    fn into_file_id(self) -> Result<FileId> {
        self.parse()
    }
}

/// Stored attributes of a file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileInfo {
    pub id: FileId,
    pub filename: String,
    /// Stored bytes, after compression.
    pub length: u64,
    pub chunk_size: usize,
    pub upload_date: DateTime<Utc>,
    /// Hex SHA-256 of the original content.
    pub sha256: String,
    pub metadata: Metadata,
}

impl FileInfo {
    pub fn is_compressed(&self) -> bool {
        self.metadata
            .get(COMPRESSED_KEY)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

/// The file-store database of the current context, with its tables in place.
fn files() -> Result<(Rc<Connection>, usize)> {
    let ctx = ResourceContext::require()?;
    let conn = ctx.store_handle()?.files_database()?;
    conn.execute_batch(SCHEMA)?;
    Ok((conn, ctx.store_config().chunk_size))
}

fn digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Store `data` under `filename` and return its new id.
///
/// With `compress`, content is LZ4 compressed and the `compressed` flag is
/// set in the stored metadata. Without it, any caller supplied flag is
/// dropped so reads never try to decompress plain content.
pub fn put(filename: &str, data: &[u8], compress: bool, mut metadata: Metadata) -> Result<FileId> {
    let (conn, chunk_size) = files()?;

    let sha256 = digest(data);
    let stored: Cow<'_, [u8]> = if compress {
        metadata.insert(COMPRESSED_KEY.to_string(), serde_json::Value::Bool(true));
        Cow::Owned(lz4_flex::compress_prepend_size(data))
    } else {
        metadata.remove(COMPRESSED_KEY);
        Cow::Borrowed(data)
    };

    let id = FileId::generate();
    let upload_date = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO fs_files (id, filename, length, chunk_size, upload_date, sha256, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id.to_string(),
            filename,
            stored.len() as i64,
            chunk_size as i64,
            upload_date,
            sha256,
            serde_json::to_string(&metadata)?,
        ],
    )?;
    {
        let mut insert = tx.prepare("INSERT INTO fs_chunks (file_id, n, data) VALUES (?1, ?2, ?3)")?;
        for (n, chunk) in stored.chunks(chunk_size).enumerate() {
            insert.execute(params![id.to_string(), n as i64, chunk])?;
        }
    }
    tx.commit()?;

    FILES_PUT.increment();
    tracing::debug!(%id, filename, length = data.len(), stored = stored.len(), compress, "stored file");
    Ok(id)
}

/// Store everything `reader` yields under `filename`.
pub fn put_reader(
    filename: &str,
    mut reader: impl io::Read,
    compress: bool,
    metadata: Metadata,
) -> Result<FileId> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    put(filename, &data, compress, metadata)
}

/// Upload a local file, recorded under its path as given.
pub fn put_file(path: impl AsRef<Path>, compress: bool, metadata: Metadata) -> Result<FileId> {
    let path = path.as_ref();
    let data = std::fs::read(path)?;
    put(&path.to_string_lossy(), &data, compress, metadata)
}

/// Fetch the content and info of a file.
pub fn get(id: impl IntoFileId) -> Result<(Vec<u8>, FileInfo)> {
    let id = id.into_file_id()?;
    let (conn, _) = files()?;
    let info = load_info(&conn, &id)?.ok_or_else(|| Error::NotFound(id.to_string()))?;
    let data = read_content(&conn, &info)?;
    FILES_GET.increment();
    tracing::trace!(%id, length = data.len(), "read file");
    Ok((data, info))
}

/// Fetch a file and write it into `target_dir` under the base name of its
/// stored filename. Returns the written path.
pub fn get_file(id: impl IntoFileId, target_dir: impl AsRef<Path>) -> Result<(PathBuf, FileInfo)> {
    let (data, info) = get(id)?;
    let name = match Path::new(&info.filename).file_name() {
        Some(name) => name.to_os_string(),
        None => info.id.to_string().into(),
    };
    let path = target_dir.as_ref().join(name);
    std::fs::write(&path, &data)?;
    Ok((path, info))
}

/// Delete a file. Deleting a missing id is a no-op returning `false`.
pub fn delete(id: impl IntoFileId) -> Result<bool> {
    let id = id.into_file_id()?;
    let (conn, _) = files()?;
    let removed = delete_in(&conn, &id)?;
    if removed {
        tracing::debug!(%id, "deleted file");
    }
    Ok(removed)
}

/// Delete every stored copy of `filename`, newest first. Returns how many
/// were removed.
pub fn delete_by_filename(filename: &str) -> Result<usize> {
    let (conn, _) = files()?;
    let mut removed = 0;
    while let Some(id) = latest_id(&conn, filename)? {
        if delete_in(&conn, &id)? {
            removed += 1;
        }
    }
    tracing::debug!(filename, removed, "deleted files by name");
    Ok(removed)
}

pub fn exists(id: impl IntoFileId) -> Result<bool> {
    let id = id.into_file_id()?;
    let (conn, _) = files()?;
    let found = conn
        .query_row("SELECT 1 FROM fs_files WHERE id = ?1", [id.to_string()], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

pub fn exists_by_filename(filename: &str) -> Result<bool> {
    let (conn, _) = files()?;
    Ok(latest_id(&conn, filename)?.is_some())
}

/// Info of the newest file stored under `filename`.
pub fn last_version(filename: &str) -> Result<FileInfo> {
    let (conn, _) = files()?;
    let id = latest_id(&conn, filename)?.ok_or_else(|| Error::NotFound(filename.to_string()))?;
    load_info(&conn, &id)?.ok_or_else(|| Error::NotFound(filename.to_string()))
}

/// Content and info of the newest file stored under `filename`.
pub fn get_last_version(filename: &str) -> Result<(Vec<u8>, FileInfo)> {
    let info = last_version(filename)?;
    get(info.id)
}

fn latest_id(conn: &Connection, filename: &str) -> Result<Option<FileId>> {
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM fs_files WHERE filename = ?1
             ORDER BY upload_date DESC, id DESC LIMIT 1",
            [filename],
            |row| row.get(0),
        )
        .optional()?;
    id.map(|id| id.parse()).transpose()
}

fn delete_in(conn: &Connection, id: &FileId) -> Result<bool> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM fs_chunks WHERE file_id = ?1", [id.to_string()])?;
    let removed = tx.execute("DELETE FROM fs_files WHERE id = ?1", [id.to_string()])?;
    tx.commit()?;
    if removed > 0 {
        FILES_DELETED.increment();
    }
    Ok(removed > 0)
}

fn load_info(conn: &Connection, id: &FileId) -> Result<Option<FileInfo>> {
    let row: Option<(String, i64, i64, String, String, String)> = conn
        .query_row(
            &format!("{SELECT_INFO} WHERE id = ?1"),
            [id.to_string()],
            |row| {
                Ok((
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            },
        )
        .optional()?;

    let Some((filename, length, chunk_size, upload_date, sha256, metadata)) = row else {
        return Ok(None);
    };
    let upload_date = DateTime::parse_from_rfc3339(&upload_date)
        .map_err(|e| corrupted(id, format!("bad upload date: {e}")))?
        .with_timezone(&Utc);

    Ok(Some(FileInfo {
        id: *id,
        filename,
        length: length as u64,
        chunk_size: chunk_size as usize,
        upload_date,
        sha256,
        metadata: serde_json::from_str(&metadata)?,
    }))
}

/// Reassemble and verify the original content of `info`.
fn read_content(conn: &Connection, info: &FileInfo) -> Result<Vec<u8>> {
    let mut stmt = conn.prepare("SELECT n, data FROM fs_chunks WHERE file_id = ?1 ORDER BY n")?;
    let rows = stmt.query_map([info.id.to_string()], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?;

    let mut stored = Vec::with_capacity(info.length as usize);
    for (expected, row) in rows.enumerate() {
        let (n, chunk) = row?;
        if n != expected as i64 {
            return Err(corrupted(&info.id, format!("missing chunk {expected}")));
        }
        stored.extend_from_slice(&chunk);
    }
    if stored.len() as u64 != info.length {
        return Err(corrupted(
            &info.id,
            format!("expected {} bytes, found {}", info.length, stored.len()),
        ));
    }

    let data = if info.is_compressed() {
        lz4_flex::decompress_size_prepended(&stored).map_err(|e| Error::Compression(e.to_string()))?
    } else {
        stored
    };
    if digest(&data) != info.sha256 {
        return Err(corrupted(&info.id, "content digest mismatch".to_string()));
    }
    Ok(data)
}

fn corrupted(id: &FileId, reason: String) -> Error {
    Error::Corrupted {
        id: id.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryConnector;
    use crate::config::Config;
    use crate::store::MEMORY_HOST;

    fn with_store<T>(chunk_size: usize, f: impl FnOnce() -> Result<T>) -> T {
        let mut config = Config::default();
        config.store.host = MEMORY_HOST.to_string();
        config.store.chunk_size = chunk_size;
        let ctx = ResourceContext::new(&config)
            .unwrap()
            .with_connector(MemoryConnector::new());
        ctx.scope(f).unwrap()
    }

    fn meta(pairs: &[(&str, serde_json::Value)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn requires_context() {
        assert!(matches!(
            put("a", b"x", false, Metadata::new()),
            Err(Error::NoActiveContext)
        ));
    }

    #[test]
    fn roundtrip_across_chunks() {
        with_store(4, || {
            let data = b"0123456789abcdef01".to_vec();
            let id = put("notes.txt", &data, false, meta(&[("owner", "ann".into())]))?;
            let (read, info) = get(id)?;
            assert_eq!(read, data);
            assert_eq!(info.filename, "notes.txt");
            assert_eq!(info.length, 18);
            assert_eq!(info.chunk_size, 4);
            assert_eq!(info.metadata["owner"], "ann");
            assert!(!info.is_compressed());
            Ok(())
        });
    }

    #[test]
    fn compressed_roundtrip() {
        with_store(16, || {
            let data = "abc".repeat(1000).into_bytes();
            let id = put("big", &data, true, Metadata::new())?;
            let (read, info) = get(id.to_string())?;
            assert_eq!(read, data);
            assert!(info.is_compressed());
            assert!(info.length < data.len() as u64);
            assert_eq!(info.metadata[COMPRESSED_KEY], true);
            Ok(())
        });
    }

    #[test]
    fn caller_compressed_flag_is_ignored_without_compression() {
        with_store(1024, || {
            let id = put("plain", b"raw", false, meta(&[(COMPRESSED_KEY, true.into())]))?;
            let (read, info) = get(id)?;
            assert_eq!(read, b"raw");
            assert!(!info.metadata.contains_key(COMPRESSED_KEY));
            Ok(())
        });
    }

    #[test]
    fn empty_content() {
        with_store(8, || {
            let id = put("empty", b"", false, Metadata::new())?;
            assert_eq!(get(id)?.0, Vec::<u8>::new());
            Ok(())
        });
    }

    #[test]
    fn missing_and_invalid_ids() {
        with_store(8, || {
            let missing = FileId::generate();
            assert!(matches!(get(missing), Err(Error::NotFound(_))));
            assert!(matches!(get("not-an-id"), Err(Error::InvalidId(_))));
            assert!(!exists(missing)?);
            Ok(())
        });
    }

    #[test]
    fn delete_is_idempotent() {
        with_store(8, || {
            let id = put("a", b"data", false, Metadata::new())?;
            assert!(exists(id)?);
            assert!(delete(id)?);
            assert!(!exists(id)?);
            assert!(!delete(id)?);
            Ok(())
        });
    }

    #[test]
    fn versions_by_filename() {
        with_store(8, || {
            put("report", b"v1", false, Metadata::new())?;
            put("report", b"v2", false, Metadata::new())?;
            let newest = put("report", b"v3", false, Metadata::new())?;
            put("other", b"x", false, Metadata::new())?;

            assert_eq!(last_version("report")?.id, newest);
            assert_eq!(get_last_version("report")?.0, b"v3");

            assert_eq!(delete_by_filename("report")?, 3);
            assert!(!exists_by_filename("report")?);
            assert!(exists_by_filename("other")?);
            assert_eq!(delete_by_filename("report")?, 0);
            assert!(matches!(last_version("report"), Err(Error::NotFound(_))));
            Ok(())
        });
    }

    #[test]
    fn missing_chunk_is_corruption() {
        with_store(2, || {
            let id = put("c", b"abcdef", false, Metadata::new())?;
            let (conn, _) = files()?;
            conn.execute(
                "DELETE FROM fs_chunks WHERE file_id = ?1 AND n = 1",
                [id.to_string()],
            )?;
            assert!(matches!(get(id), Err(Error::Corrupted { .. })));
            Ok(())
        });
    }

    #[test]
    fn file_id_parsing() {
        let id = FileId::generate();
        let parsed: FileId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(matches!("".parse::<FileId>(), Err(Error::InvalidId(_))));
        assert!(matches!("zzzz".into_file_id(), Err(Error::InvalidId(_))));
    }

    #[test]
    fn ids_sort_in_generation_order() {
        let ids: Vec<FileId> = (0..100).map(|_| FileId::generate()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn local_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        std::fs::write(&source, b"local content").unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();

        with_store(5, || {
            let id = put_file(&source, true, Metadata::new())?;
            let (path, info) = get_file(id, &out)?;
            assert_eq!(path, out.join("source.bin"));
            assert_eq!(info.filename, source.to_string_lossy());
            assert_eq!(std::fs::read(&path)?, b"local content");
            Ok(())
        });
    }
}
