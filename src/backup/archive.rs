// backuptool/src/backup/archive.rs
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path};
use tar::{Builder, EntryType, Header};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::errors::{AppError, Result};

/// Counts bytes on their way to the underlying sink.
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Yields exactly `len` bytes: the source's bytes, then zeros once it runs dry.
///
/// A file that shrinks or fails mid-read after its header is written must still
/// fill the size the header announced, or every later entry is unreadable.
struct FixedLenReader<R> {
    inner: R,
    remaining: u64,
    padded: u64,
    read_error: Option<io::Error>,
}

impl<R: Read> FixedLenReader<R> {
    fn new(inner: R, len: u64) -> Self {
        Self {
            inner,
            remaining: len,
            padded: 0,
            read_error: None,
        }
    }
}

impl<R: Read> Read for FixedLenReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = usize::try_from(self.remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let n = if self.padded == 0 && self.read_error.is_none() {
            match self.inner.read(&mut buf[..max]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => return Err(e),
                Err(e) => {
                    self.read_error = Some(e);
                    0
                }
            }
        } else {
            0
        };
        let n = if n == 0 {
            buf[..max].fill(0);
            self.padded += max as u64;
            max
        } else {
            n
        };
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Streams the tree under `source_dir` into `sink` as a gzipped tar archive.
///
/// Entries are visited depth-first in file-name order, each directory before its
/// contents. Names are relative to `source_dir` and always use `/`; the root
/// itself maps to the empty name and is not emitted. An entry that cannot be
/// read is logged and skipped; a file that shrinks while it is copied is padded
/// with zeros to its recorded size. Failing to write into the archive aborts
/// the whole operation, and so does `cancel`, checked before every entry.
///
/// Returns the number of compressed bytes written to `sink`, counted after the
/// tar trailer and the gzip footer have been flushed.
pub fn write_tar_gz<W: Write>(source_dir: &Path, sink: W, cancel: &CancellationToken) -> Result<u64> {
    if !source_dir.is_dir() {
        return Err(AppError::Structural(format!(
            "Source for archival is not a directory: {}",
            source_dir.display()
        )));
    }

    let counter = CountingWriter { inner: sink, written: 0 };
    let enc = GzEncoder::new(counter, Compression::default());
    let mut tar_builder = Builder::new(enc);
    tar_builder.follow_symlinks(false);

    let mut entries = 0usize;
    let mut skipped = 0usize;

    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled(format!(
                "Archiving {} stopped after {} entries",
                source_dir.display(),
                entries
            )));
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(root = %source_dir.display(), error = %e, "skipping unreadable entry");
                skipped += 1;
                continue;
            }
        };
        let path = entry.path();
        let Some(name) = archive_name(source_dir, path) else {
            continue;
        };

        match append_entry(&mut tar_builder, path, &name)? {
            true => entries += 1,
            false => skipped += 1,
        }
    }

    let encoder = tar_builder.into_inner().map_err(|e| {
        AppError::Structural(format!(
            "Failed to finish tar stream for {}: {}",
            source_dir.display(),
            e
        ))
    })?;
    let mut counter = encoder.finish().map_err(|e| {
        AppError::Structural(format!(
            "Failed to finish gzip stream for {}: {}",
            source_dir.display(),
            e
        ))
    })?;
    counter.flush().map_err(|e| {
        AppError::Structural(format!("Failed to flush archive sink: {}", e))
    })?;

    tracing::debug!(
        root = %source_dir.display(),
        entries,
        skipped,
        bytes = counter.written,
        "archive stream complete"
    );
    Ok(counter.written)
}

/// Relative, slash-separated name for `path` under `root`, or `None` for the root itself.
///
/// Components are split by the host's separators only, so a `\` inside a Unix
/// file name stays part of that name.
pub fn archive_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Appends one filesystem entry. `Ok(false)` means the entry was skipped;
/// `Err` means the archive itself can no longer be trusted.
fn append_entry<W: Write>(tar_builder: &mut Builder<W>, path: &Path, name: &str) -> Result<bool> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "skipping entry, cannot stat");
            return Ok(false);
        }
    };
    let file_type = metadata.file_type();

    let mut header = Header::new_gnu();
    header.set_metadata(&metadata);

    let structural = |e: io::Error| {
        AppError::Structural(format!("Failed to append {} to archive: {}", name, e))
    };

    if file_type.is_dir() {
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        tar_builder
            .append_data(&mut header, format!("{}/", name), io::empty())
            .map_err(structural)?;
    } else if file_type.is_file() {
        // Opened before the header is written so an unreadable file never leaves
        // a header without its payload.
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping file, cannot open");
                return Ok(false);
            }
        };
        append_regular(tar_builder, &mut header, name, file, metadata.len(), path)?;
    } else if file_type.is_symlink() {
        let target = match fs::read_link(path) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping symlink, cannot read target");
                return Ok(false);
            }
        };
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        tar_builder
            .append_link(&mut header, name, &target)
            .map_err(structural)?;
    } else {
        tracing::debug!(path = %path.display(), "skipping special file");
        return Ok(false);
    }
    Ok(true)
}

/// Writes a regular file entry of exactly `len` bytes from `source`.
fn append_regular<W: Write, R: Read>(
    tar_builder: &mut Builder<W>,
    header: &mut Header,
    name: &str,
    source: R,
    len: u64,
    path: &Path,
) -> Result<()> {
    header.set_entry_type(EntryType::Regular);
    header.set_size(len);
    let mut body = FixedLenReader::new(source, len);
    tar_builder
        .append_data(header, name, &mut body)
        .map_err(|e| AppError::Structural(format!("Failed to append {} to archive: {}", name, e)))?;
    if body.padded > 0 {
        match &body.read_error {
            Some(e) => tracing::warn!(path = %path.display(), error = %e, padded = body.padded, "read failed mid-file, padded with zeros"),
            None => tracing::warn!(path = %path.display(), padded = body.padded, "file shrank while archiving, padded with zeros"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> String {
        let raw = String::from_utf8(entry.path_bytes().into_owned()).unwrap();
        raw.trim_end_matches('/').to_string()
    }

    /// name -> (is_dir, contents)
    fn read_archive(bytes: &[u8]) -> BTreeMap<String, (bool, Vec<u8>)> {
        read_entries(tar::Archive::new(GzDecoder::new(bytes)))
    }

    fn read_entries<R: Read>(mut archive: tar::Archive<R>) -> BTreeMap<String, (bool, Vec<u8>)> {
        let mut out = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let raw_name = entry_name(&entry);
            let is_dir = entry.header().entry_type().is_dir();
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents).unwrap();
            out.insert(raw_name, (is_dir, contents));
        }
        out
    }

    #[test]
    fn test_file_and_empty_subdirectory() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("a");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("x.txt"), "hi").unwrap();

        let mut buf: Vec<u8> = Vec::new();
        let written = write_tar_gz(&root, &mut buf, &CancellationToken::new()).unwrap();
        assert_eq!(written, buf.len() as u64);

        let entries = read_archive(&buf);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries.get("x.txt"), Some(&(false, b"hi".to_vec())));
        assert_eq!(entries.get("sub"), Some(&(true, Vec::new())));
        for name in entries.keys() {
            assert!(!name.starts_with('/'));
            assert!(!name.starts_with("a/"));
            assert_ne!(name, "a");
            assert_ne!(name, ".");
        }
    }

    #[test]
    fn test_round_trip_nested_tree() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("site");
        fs::create_dir_all(root.join("css/vendor")).unwrap();
        fs::create_dir_all(root.join("img")).unwrap();
        fs::write(root.join("index.html"), "<html></html>").unwrap();
        fs::write(root.join("css/site.css"), "body{}").unwrap();
        fs::write(root.join("css/vendor/reset.css"), "*{margin:0}").unwrap();
        let blob: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(root.join("img/logo.bin"), &blob).unwrap();

        let mut buf: Vec<u8> = Vec::new();
        write_tar_gz(&root, &mut buf, &CancellationToken::new()).unwrap();

        let out = tmp.path().join("out");
        fs::create_dir_all(&out).unwrap();
        tar::Archive::new(GzDecoder::new(&buf[..])).unpack(&out).unwrap();

        assert_eq!(fs::read(out.join("index.html")).unwrap(), b"<html></html>");
        assert_eq!(fs::read(out.join("css/site.css")).unwrap(), b"body{}");
        assert_eq!(fs::read(out.join("css/vendor/reset.css")).unwrap(), b"*{margin:0}");
        assert_eq!(fs::read(out.join("img/logo.bin")).unwrap(), blob);
        assert!(out.join("css/vendor").is_dir());
    }

    #[test]
    fn test_directories_precede_their_contents() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("b/inner")).unwrap();
        fs::write(root.join("b/inner/f"), "1").unwrap();
        fs::write(root.join("a.txt"), "2").unwrap();

        let mut buf: Vec<u8> = Vec::new();
        write_tar_gz(root, &mut buf, &CancellationToken::new()).unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(&buf[..]));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| entry_name(&e.unwrap()))
            .collect();
        assert_eq!(names, vec!["a.txt", "b", "b/inner", "b/inner/f"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_file_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::write(root.join("ok.txt"), "fine").unwrap();
        let secret = root.join("secret.txt");
        fs::write(&secret, "nope").unwrap();
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o000)).unwrap();

        // root can still open mode 000 files; only assert the skip when it applies.
        let readable = File::open(&secret).is_ok();

        let mut buf: Vec<u8> = Vec::new();
        write_tar_gz(root, &mut buf, &CancellationToken::new()).unwrap();
        let entries = read_archive(&buf);
        assert_eq!(entries.get("ok.txt"), Some(&(false, b"fine".to_vec())));
        assert_eq!(entries.contains_key("secret.txt"), readable);
    }

    #[test]
    fn test_missing_source_is_structural() {
        let tmp = TempDir::new().unwrap();
        let err = write_tar_gz(&tmp.path().join("missing"), Vec::<u8>::new(), &CancellationToken::new()).unwrap_err();
        assert_eq!(err.kind(), crate::errors::FailureKind::Structural);
    }

    #[test]
    fn test_archive_name_relativizes() {
        let root = Path::new("/srv/www");
        assert_eq!(archive_name(root, Path::new("/srv/www")), None);
        assert_eq!(
            archive_name(root, Path::new("/srv/www/css/site.css")).as_deref(),
            Some("css/site.css")
        );
        assert_eq!(archive_name(root, Path::new("/elsewhere/x")), None);
    }
    /// Plain tar builder with `entries` appended through `append_entry`.
    fn tar_of(entries: &[(&Path, &str)]) -> (Vec<bool>, Vec<u8>) {
        let mut builder = Builder::new(Vec::new());
        let appended = entries
            .iter()
            .map(|(path, name)| append_entry(&mut builder, path, name).unwrap())
            .collect();
        (appended, builder.into_inner().unwrap())
    }

    #[test]
    fn test_file_vanished_after_walk_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let kept = tmp.path().join("kept.txt");
        let gone = tmp.path().join("gone.txt");
        fs::write(&kept, "still here").unwrap();
        fs::write(&gone, "short lived").unwrap();
        fs::remove_file(&gone).unwrap();

        let (appended, bytes) = tar_of(&[(gone.as_path(), "gone.txt"), (kept.as_path(), "kept.txt")]);
        assert_eq!(appended, vec![false, true]);

        let entries = read_entries(tar::Archive::new(&bytes[..]));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.get("kept.txt"), Some(&(false, b"still here".to_vec())));
    }

    /// Returns `data`, then fails every later read.
    struct BrokenReader<'a> {
        data: &'a [u8],
    }

    impl Read for BrokenReader<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.data.is_empty() {
                return Err(io::Error::new(io::ErrorKind::Other, "input/output error"));
            }
            let n = self.data.read(buf)?;
            Ok(n)
        }
    }

    #[test]
    fn test_shrunk_file_is_padded_to_header_size() {
        let tmp = TempDir::new().unwrap();
        let after = tmp.path().join("after.txt");
        fs::write(&after, "intact").unwrap();

        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_mode(0o644);
        // Stat said 10 bytes, the file now holds 3.
        append_regular(&mut builder, &mut header, "rotated.log", &b"abc"[..], 10, Path::new("rotated.log")).unwrap();
        let mut header = Header::new_gnu();
        header.set_mode(0o644);
        append_regular(
            &mut builder,
            &mut header,
            "broken.bin",
            BrokenReader { data: b"xy" },
            4,
            Path::new("broken.bin"),
        )
        .unwrap();
        assert!(append_entry(&mut builder, &after, "after.txt").unwrap());
        let bytes = builder.into_inner().unwrap();

        let entries = read_entries(tar::Archive::new(&bytes[..]));
        assert_eq!(entries.len(), 3);
        assert_eq!(entries.get("rotated.log"), Some(&(false, b"abc\0\0\0\0\0\0\0".to_vec())));
        assert_eq!(entries.get("broken.bin"), Some(&(false, b"xy\0\0".to_vec())));
        assert_eq!(entries.get("after.txt"), Some(&(false, b"intact".to_vec())));
    }

    #[test]
    fn test_grown_file_is_cut_to_header_size() {
        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_mode(0o644);
        append_regular(&mut builder, &mut header, "app.log", &b"0123456789"[..], 4, Path::new("app.log")).unwrap();
        let bytes = builder.into_inner().unwrap();

        let entries = read_entries(tar::Archive::new(&bytes[..]));
        assert_eq!(entries.get("app.log"), Some(&(false, b"0123".to_vec())));
    }

    #[test]
    fn test_cancelled_archive_stops() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("f"), "x").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = write_tar_gz(tmp.path(), Vec::<u8>::new(), &cancel).unwrap_err();
        assert_eq!(err.kind(), crate::errors::FailureKind::Cancelled);
    }

    #[test]
    fn test_archive_names_use_forward_slashes() {
        let root = Path::new("srv").join("www");
        let nested = root.join("css").join("vendor").join("reset.css");
        let name = archive_name(&root, &nested).unwrap();
        assert_eq!(name, "css/vendor/reset.css");
        assert!(!name.contains('\\'));
    }

    #[cfg(unix)]
    #[test]
    fn test_backslash_in_unix_name_is_kept() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::write(root.join("a").join("b"), "nested").unwrap();
        fs::write(root.join("a\\b"), "literal").unwrap();

        assert_eq!(archive_name(root, &root.join("a\\b")).as_deref(), Some("a\\b"));

        let mut buf: Vec<u8> = Vec::new();
        write_tar_gz(root, &mut buf, &CancellationToken::new()).unwrap();
        let entries = read_archive(&buf);
        assert_eq!(entries.get("a/b"), Some(&(false, b"nested".to_vec())));
        assert_eq!(entries.get("a\\b"), Some(&(false, b"literal".to_vec())));
    }
}
