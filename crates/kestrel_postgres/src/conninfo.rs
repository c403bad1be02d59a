//! `primary_conninfo` construction and the `postgresql.auto.conf` rewrite
//! discipline: compute what the file should say, compare with what it does
//! say, and touch the file only on a real difference.

use std::io;
use std::path::Path;

pub const AUTO_CONF: &str = "postgresql.auto.conf";

/// Quote one conninfo value per libpq rules: wrap in single quotes and
/// backslash-escape embedded backslashes and quotes. Always quoted, so
/// hostile or merely unusual values (spaces, empty strings) cannot change
/// the meaning of the string.
pub fn quote_conninfo_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

/// The conninfo string pointing a standby at its upstream.
pub fn primary_conninfo(host: &str, port: u16, user: &str) -> String {
    format!(
        "host={} port={} user={}",
        quote_conninfo_value(host),
        port,
        quote_conninfo_value(user)
    )
}

/// The configuration line carrying `conninfo`, with GUC-file quoting
/// (single quotes doubled).
fn conninfo_line(conninfo: &str) -> String {
    format!("primary_conninfo = '{}'", conninfo.replace('\'', "''"))
}

/// Point `postgresql.auto.conf` in `data_dir` at `conninfo`.
///
/// Returns `Ok(true)` when the file was rewritten and the server needs a
/// config reload, `Ok(false)` when the desired line was already present.
/// Lines other than `primary_conninfo` are preserved as-is.
pub fn update_primary_conninfo(data_dir: &Path, conninfo: &str) -> io::Result<bool> {
    let path = data_dir.join(AUTO_CONF);
    let current = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err),
    };

    let desired = conninfo_line(conninfo);
    let mut lines: Vec<String> = current.lines().map(str::to_string).collect();
    let mut found = false;
    let mut changed = false;

    for line in lines.iter_mut() {
        if line.trim_start().starts_with("primary_conninfo") {
            found = true;
            if *line != desired {
                *line = desired.clone();
                changed = true;
            }
            break;
        }
    }
    if !found {
        lines.push(desired);
        changed = true;
    }

    if changed {
        let mut content = lines.join("\n");
        content.push('\n');
        std::fs::write(&path, content)?;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_values_are_still_quoted() {
        assert_eq!(quote_conninfo_value("db-1"), "'db-1'");
        assert_eq!(quote_conninfo_value(""), "''");
    }

    #[test]
    fn test_hostile_values_are_escaped() {
        assert_eq!(quote_conninfo_value("o'brien"), r"'o\'brien'");
        assert_eq!(quote_conninfo_value(r"a\b"), r"'a\\b'");
        assert_eq!(
            quote_conninfo_value("x port=9 host=evil"),
            "'x port=9 host=evil'"
        );
    }

    #[test]
    fn test_primary_conninfo_shape() {
        assert_eq!(
            primary_conninfo("db-1", 5432, "postgres"),
            "host='db-1' port=5432 user='postgres'"
        );
    }

    #[test]
    fn test_update_creates_line_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(AUTO_CONF),
            "# Do not edit this file manually!\nwal_level = 'logical'\n",
        )
        .unwrap();

        let conninfo = primary_conninfo("db-1", 5432, "postgres");
        assert!(update_primary_conninfo(dir.path(), &conninfo).unwrap());

        let content = std::fs::read_to_string(dir.path().join(AUTO_CONF)).unwrap();
        assert!(content.contains("wal_level = 'logical'"), "other lines kept");
        assert!(content.contains("primary_conninfo = 'host=''db-1'' port=5432 user=''postgres'''"));
    }

    #[test]
    fn test_update_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let conninfo = primary_conninfo("db-1", 5432, "postgres");
        assert!(update_primary_conninfo(dir.path(), &conninfo).unwrap());
        assert!(
            !update_primary_conninfo(dir.path(), &conninfo).unwrap(),
            "second write with identical value must be a no-op"
        );
    }

    #[test]
    fn test_update_replaces_stale_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let old = primary_conninfo("db-1", 5432, "postgres");
        update_primary_conninfo(dir.path(), &old).unwrap();

        let new = primary_conninfo("db-2", 5432, "postgres");
        assert!(update_primary_conninfo(dir.path(), &new).unwrap());

        let content = std::fs::read_to_string(dir.path().join(AUTO_CONF)).unwrap();
        assert!(content.contains("db-2"));
        assert!(!content.contains("db-1"));
        assert_eq!(
            content.matches("primary_conninfo").count(),
            1,
            "exactly one primary_conninfo line"
        );
    }

    #[test]
    fn test_update_handles_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let conninfo = primary_conninfo("db-1", 5432, "postgres");
        assert!(update_primary_conninfo(dir.path(), &conninfo).unwrap());
        assert!(dir.path().join(AUTO_CONF).exists());
    }
}
