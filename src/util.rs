use std::{fmt::Display, fs, io, path::Path};

use chrono::Utc;
#[allow(unused_imports)]
use log::{debug, error};

pub trait ResultExt {
    // Log an error if it occurs, prefixed with s, otherwise return nothing.
    fn or_log_error(&self, s: &str);
}

impl<T, E> ResultExt for Result<T, E>
where
    E: Display,
{
    fn or_log_error(&self, s: &str) {
        if let Err(e) = self {
            error!("{} - {}", s, e);
        }
    }
}

pub trait IoResultExt {
    fn ignore(self, kind: io::ErrorKind) -> Self;
}

impl IoResultExt for io::Result<()> {
    fn ignore(self, kind: io::ErrorKind) -> io::Result<()> {
        match self {
            Err(e) => {
                if e.kind() == kind {
                    Ok(())
                } else {
                    Err(e)
                }
            }
            Ok(()) => Ok(()),
        }
    }
}

// ISO-8601 UTC at seconds precision with a Z suffix, the timestamp format
// stamped into task records and DONE sentinels.
pub fn utc_now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// Minute-resolution header timestamp for session log sections.
pub fn utc_now_minute() -> String {
    Utc::now().format("%Y-%m-%d %H:%M UTC").to_string()
}

// Last n lines of a file, newline-terminated if there was anything to read.
// Unreadable or missing files yield the empty string; callers use this for
// post-mortem snippets where an error would just replace one missing
// diagnostic with another.
pub fn tail_lines(path: &Path, n: usize) -> String {
    let Ok(text) = fs::read_to_string(path) else {
        return String::new();
    };
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n") + "\n"
}
