use crate::bridge::entry::LedgerEntry;
use crate::bridge::warn::{self, WarnEvent};
use crate::error::{BridgeError, WarnCode};
use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// True when the file is non-empty and its last byte is not a newline.
fn ends_mid_line(file: &mut File) -> io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn unwritable(path: &Path, err: io::Error) -> BridgeError {
    BridgeError::LedgerUnwritable(format!("{}: {err}", path.display()))
}

/// Append-only JSONL ledger.
///
/// Lines are only ever appended; nothing in this crate truncates or rewrites
/// the file. Readers never lock and tolerate a partial trailing line.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_for_append(&self) -> Result<File, BridgeError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| unwritable(parent, err))?;
        }
        OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| unwritable(&self.path, err))
    }

    /// Fails when the storage location cannot take appends. Creates missing
    /// parent directories but never the ledger itself: a missing ledger is
    /// probed with a throwaway file next to it.
    pub fn ensure_writable(&self) -> Result<(), BridgeError> {
        if self.path.is_file() {
            return OpenOptions::new()
                .append(true)
                .open(&self.path)
                .map(drop)
                .map_err(|err| unwritable(&self.path, err));
        }

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|err| unwritable(&dir, err))?;
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "ledger".to_string());
        let probe = dir.join(format!(".{name}.probe-{}", std::process::id()));
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&probe)
            .map_err(|err| unwritable(&self.path, err))?;
        let _ = fs::remove_file(&probe);
        Ok(())
    }

    /// Write one newline-terminated record with a single `write_all` while
    /// holding an exclusive lock, so concurrent appenders never interleave.
    /// A partial last line left by an interrupted writer is terminated first
    /// so the new record starts on a line of its own.
    pub fn append(&self, entry: &LedgerEntry) -> Result<()> {
        let record = serde_json::to_string(entry)?;

        let mut file = self.open_for_append()?;
        file.lock_exclusive()
            .with_context(|| format!("failed to lock {}", self.path.display()))?;
        let written = ends_mid_line(&mut file)
            .and_then(|partial| {
                let mut line = String::with_capacity(record.len() + 2);
                if partial {
                    line.push('\n');
                }
                line.push_str(&record);
                line.push('\n');
                file.write_all(line.as_bytes())
            })
            .and_then(|()| file.flush())
            .with_context(|| format!("failed to append to {}", self.path.display()));
        let _ = FileExt::unlock(&file);
        written
    }

    /// Lazily iterate every entry in file order. A missing file reads as empty.
    pub fn read_all(&self) -> Result<LedgerReader> {
        let reader = match File::open(&self.path) {
            Ok(file) => Some(BufReader::new(file)),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", self.path.display()));
            }
        };
        Ok(LedgerReader {
            reader,
            path: self.path.clone(),
            line_no: 0,
            skipped: 0,
        })
    }

    pub fn entries(&self) -> Result<(Vec<LedgerEntry>, usize)> {
        let mut reader = self.read_all()?;
        let entries = reader.by_ref().collect::<Vec<_>>();
        Ok((entries, reader.skipped()))
    }
}

/// Iterator over ledger entries that skips unreadable lines.
pub struct LedgerReader {
    reader: Option<BufReader<File>>,
    path: PathBuf,
    line_no: usize,
    skipped: usize,
}

impl LedgerReader {
    /// Lines dropped so far because they could not be parsed.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn skip(&mut self, reason: &str, err: &str) {
        self.skipped += 1;
        warn::emit(WarnEvent {
            code: WarnCode::LedgerCorrupt,
            stage: "ledger-read",
            action: "skip-line",
            conversation: "",
            note: "",
            reason,
            err: &format!("{}:{} {err}", self.path.display(), self.line_no),
        });
    }
}

impl Iterator for LedgerReader {
    type Item = LedgerEntry;

    fn next(&mut self) -> Option<LedgerEntry> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let reader = self.reader.as_mut()?;
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => {
                    self.reader = None;
                    return None;
                }
                Ok(_) => {}
                Err(err) => {
                    self.line_no += 1;
                    self.skip("read-error", &err.to_string());
                    self.reader = None;
                    return None;
                }
            }
            self.line_no += 1;

            let trimmed = buf.trim_ascii();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_slice::<LedgerEntry>(trimmed) {
                Ok(entry) => return Some(entry),
                Err(err) => self.skip("unparsable-line", &err.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::entry::EntryKind;
    use crate::bridge::reconcile::{ImportState, Reconciliation};
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn missing_file_reads_empty_and_first_append_creates_it() {
        let tmp = tempdir().expect("tempdir");
        let ledger = Ledger::new(tmp.path().join("nested/ledger.jsonl"));

        assert_eq!(ledger.read_all().expect("read").count(), 0);
        assert!(!ledger.path().exists());

        ledger
            .append(&LedgerEntry::exists_confirmed(Some("n1".into()), Some("a".into()), 1))
            .expect("append");
        let (entries, skipped) = ledger.entries().expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(skipped, 0);
        assert_eq!(entries[0].kind, EntryKind::ExistsConfirmed);
    }

    #[test]
    fn corrupt_and_partial_lines_are_skipped() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("ledger.jsonl");
        let mut raw = Vec::new();
        raw.extend_from_slice(b"{\"kind\":\"note_created\",\"conversation_id\":\"a\",\"timestamp\":1}\n");
        raw.extend_from_slice(b"not json at all\n");
        raw.extend_from_slice(b"\n");
        raw.extend_from_slice(b"\xff\xfe{\"kind\"\n");
        raw.extend_from_slice(b"{\"kind\":\"exists_denied\",\"conversation_id\":\"a\",\"timestamp\":2}\n");
        raw.extend_from_slice(b"{\"kind\":\"note_created\",\"conversa");
        fs::write(&path, raw).expect("write");

        let ledger = Ledger::new(&path);
        let (entries, skipped) = ledger.entries().expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(skipped, 3);
        assert_eq!(entries[1].kind, EntryKind::ExistsDenied);
    }

    #[test]
    fn append_after_interrupted_write_starts_a_fresh_line() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("ledger.jsonl");
        fs::write(
            &path,
            "{\"kind\":\"note_created\",\"conversation_id\":\"old\",\"timestamp\":1}\n{\"kind\":\"note_created\",\"conversa",
        )
        .expect("write");

        let ledger = Ledger::new(&path);
        ledger
            .append(&LedgerEntry::note_created(
                Some("n1".into()),
                Some("T".into()),
                Some("abc".into()),
                Some(10),
                5,
            ))
            .expect("append");

        let (entries, skipped) = ledger.entries().expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(skipped, 1);
        let rec = Reconciliation::from_entries(&entries);
        assert_eq!(rec.state("abc"), ImportState::Imported);
        assert!(fs::read_to_string(&path).expect("read").ends_with("}\n"));
    }

    #[test]
    fn append_to_newline_terminated_file_adds_no_blank_line() {
        let tmp = tempdir().expect("tempdir");
        let ledger = Ledger::new(tmp.path().join("ledger.jsonl"));
        for ts in [1, 2] {
            ledger
                .append(&LedgerEntry::exists_confirmed(Some("n1".into()), Some("abc".into()), ts))
                .expect("append");
        }
        let raw = fs::read_to_string(ledger.path()).expect("read");
        assert_eq!(raw.lines().count(), 2);
        assert!(!raw.contains("\n\n"));
    }

    #[test]
    fn append_never_rewrites_existing_lines() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("ledger.jsonl");
        fs::write(&path, "legacy line kept verbatim\n").expect("seed");

        let ledger = Ledger::new(&path);
        ledger
            .append(&LedgerEntry::exists_denied(None, Some("a".into()), 3))
            .expect("append");

        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.starts_with("legacy line kept verbatim\n"));
        assert_eq!(raw.lines().count(), 2);
    }

    #[test]
    fn concurrent_appends_produce_whole_lines() {
        let tmp = tempdir().expect("tempdir");
        let ledger = Arc::new(Ledger::new(tmp.path().join("ledger.jsonl")));

        let handles = (0..8)
            .map(|worker| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    for i in 0..25 {
                        let entry = LedgerEntry::note_created(
                            Some(format!("n-{worker}-{i}")),
                            Some("x".repeat(512)),
                            Some(format!("c-{worker}-{i}")),
                            Some(512),
                            i,
                        );
                        ledger.append(&entry).expect("append");
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("join");
        }

        let (entries, skipped) = ledger.entries().expect("entries");
        assert_eq!(skipped, 0);
        assert_eq!(entries.len(), 200);
    }

    #[cfg(unix)]
    #[test]
    fn unwritable_location_is_reported() {
        let tmp = tempdir().expect("tempdir");
        let blocker = tmp.path().join("file");
        fs::write(&blocker, "x").expect("write");
        let ledger = Ledger::new(blocker.join("ledger.jsonl"));
        let err = ledger.ensure_writable().unwrap_err();
        assert!(matches!(err, BridgeError::LedgerUnwritable(_)));
    }

    #[test]
    fn writable_check_leaves_no_file_behind() {
        let tmp = tempdir().expect("tempdir");
        let ledger = Ledger::new(tmp.path().join("nested/ledger.jsonl"));
        ledger.ensure_writable().expect("writable");
        assert!(!ledger.path().exists());
        assert_eq!(fs::read_dir(tmp.path().join("nested")).expect("dir").count(), 0);
    }
}
