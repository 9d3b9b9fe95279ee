//! The append-only known-hosts file.
//!
//! One OpenSSH-format line per entry. Appends go through a whole-file
//! read-then-append so a file left without a trailing newline (manual
//! edits, a torn write) never gets two entries glued together. Concurrent
//! appenders are tolerated; lines may interleave but never merge.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

/// All entries currently in the file. A missing file is an empty list.
pub fn load(path: &Path) -> io::Result<Vec<String>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    Ok(contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.to_string())
        .collect())
}

/// Append one entry, creating the file if needed. The entry must be a
/// single line; a trailing newline is added, plus a leading one when the
/// existing file does not end in a newline.
pub fn append(path: &Path, entry: &str) -> io::Result<()> {
    debug_assert!(!entry.contains('\n'));

    let needs_newline = match std::fs::read(path) {
        Ok(contents) => !contents.is_empty() && contents.last() != Some(&b'\n'),
        Err(err) if err.kind() == io::ErrorKind::NotFound => false,
        Err(err) => return Err(err),
    };

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut line = String::with_capacity(entry.len() + 2);
    if needs_newline {
        line.push('\n');
    }
    line.push_str(entry);
    line.push('\n');
    // One write call, so concurrent appenders interleave whole lines.
    file.write_all(line.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENTRY: &str = "example.com ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABgQC7";

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        assert!(load(&path).unwrap().is_empty());
    }

    #[test]
    fn append_creates_and_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");

        append(&path, ENTRY).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw, format!("{ENTRY}\n"));
        assert_eq!(load(&path).unwrap(), vec![ENTRY.to_string()]);
    }

    #[test]
    fn append_to_unterminated_file_inserts_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(&path, "torn-entry ssh-rsa AAAA").unwrap();

        append(&path, ENTRY).unwrap();
        let entries = load(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], "torn-entry ssh-rsa AAAA");
        assert_eq!(entries[1], ENTRY);
    }

    #[test]
    fn repeated_appends_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        for i in 0..3 {
            append(&path, &format!("host{i} ssh-rsa KEY{i}")).unwrap();
        }
        let entries = load(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2], "host2 ssh-rsa KEY2");
    }
}
