//! Observation metadata as newline-delimited `KEYWORD value` pairs.
//!
//! ```text
//! HDR_VERSION  1.0
//! NCHAN        1024
//! NBIT         8
//! UTC_START    2024-03-01-12:00:00
//! ```
//!
//! Keys keep their insertion order so a header round-trips through
//! [`AsciiHeader::raw`] with only whitespace normalised. Lines starting with
//! `#` and blank lines are ignored.

use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

/// Errors from header parsing and lookup.
#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("header key `{key}` is missing")]
    Missing { key: String },
    #[error("header key `{key}` has unparsable value `{value}`")]
    Parse { key: String, value: String },
    #[error("header line {line} has no value: `{text}`")]
    Malformed { line: usize, text: String },
    #[error("failed to read header file `{path}`: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// An ordered ASCII key/value dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsciiHeader {
    entries: Vec<(String, String)>,
}

impl AsciiHeader {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Parses a header blob.
    ///
    /// # Errors
    ///
    /// A non-comment line with a key but no value.
    pub fn load_from_str(text: &str) -> Result<Self, HeaderError> {
        let mut header = Self::new();
        header.append_from_str(text)?;
        Ok(header)
    }

    /// Parses header bytes, ignoring trailing NUL padding.
    ///
    /// # Errors
    ///
    /// See [`load_from_str`](Self::load_from_str).
    pub fn load_from_bytes(bytes: &[u8]) -> Result<Self, HeaderError> {
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Self::load_from_str(&String::from_utf8_lossy(&bytes[..end]))
    }

    /// Reads and parses a header file.
    ///
    /// # Errors
    ///
    /// I/O failure or malformed content.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, HeaderError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| HeaderError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    /// Merges `text` into this header; later keys override earlier ones.
    ///
    /// # Errors
    ///
    /// A non-comment line with a key but no value.
    pub fn append_from_str(&mut self, text: &str) -> Result<(), HeaderError> {
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let key = parts.next().unwrap_or_default();
            let value = parts.next().map(str::trim).unwrap_or_default();
            if value.is_empty() {
                return Err(HeaderError::Malformed {
                    line: idx + 1,
                    text: line.to_string(),
                });
            }
            self.set(key, value);
        }
        Ok(())
    }

    /// Merges every entry of `other` into this header.
    pub fn merge(&mut self, other: &Self) {
        for (key, value) in &other.entries {
            self.set(key, value);
        }
    }

    /// Raw string value of `key`.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.get_str(key).is_some()
    }

    /// Typed value of a required key.
    ///
    /// # Errors
    ///
    /// Missing key or unparsable value.
    pub fn get<T: FromStr>(&self, key: &str) -> Result<T, HeaderError> {
        self.get_opt(key)?.ok_or_else(|| HeaderError::Missing {
            key: key.to_string(),
        })
    }

    /// Typed value of an optional key.
    ///
    /// # Errors
    ///
    /// The key is present but its value does not parse.
    pub fn get_opt<T: FromStr>(&self, key: &str) -> Result<Option<T>, HeaderError> {
        match self.get_str(key) {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|_| HeaderError::Parse {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Sets `key`, replacing any existing value in place.
    pub fn set(&mut self, key: &str, value: impl Display) {
        let value = value.to_string();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    /// Removes `key`, returning its value.
    pub fn del(&mut self, key: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serialises the header, one aligned `KEY value` pair per line.
    #[must_use]
    pub fn raw(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(&format!("{key:<19} {value}\n"));
        }
        out
    }
}

impl FromStr for AsciiHeader {
    type Err = HeaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::load_from_str(s)
    }
}

impl std::fmt::Display for AsciiHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# observation
HDR_VERSION 1.0
NCHAN       1024
TSAMP       0.064
SOURCE      J0437-4715 extra words

UTC_START   2024-03-01-12:00:00
";

    #[test]
    fn test_parse_and_typed_get() {
        let header = AsciiHeader::load_from_str(SAMPLE).unwrap();
        assert_eq!(header.len(), 5);
        assert_eq!(header.get::<u32>("NCHAN").unwrap(), 1024);
        assert!((header.get::<f64>("TSAMP").unwrap() - 0.064).abs() < 1e-12);
        assert_eq!(header.get_str("SOURCE"), Some("J0437-4715 extra words"));
    }

    #[test]
    fn test_missing_and_unparsable() {
        let header = AsciiHeader::load_from_str(SAMPLE).unwrap();
        assert!(matches!(
            header.get::<u32>("NBIT"),
            Err(HeaderError::Missing { key }) if key == "NBIT"
        ));
        assert!(matches!(
            header.get::<u32>("SOURCE"),
            Err(HeaderError::Parse { .. })
        ));
        assert_eq!(header.get_opt::<u32>("NBIT").unwrap(), None);
    }

    #[test]
    fn test_append_overrides_in_place() {
        let mut header = AsciiHeader::load_from_str(SAMPLE).unwrap();
        header.append_from_str("NCHAN 512\nOBS_OFFSET 0\n").unwrap();
        assert_eq!(header.get::<u32>("NCHAN").unwrap(), 512);
        let keys: Vec<_> = header.iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            ["HDR_VERSION", "NCHAN", "TSAMP", "SOURCE", "UTC_START", "OBS_OFFSET"]
        );
    }

    #[test]
    fn test_set_and_del() {
        let mut header = AsciiHeader::new();
        header.set("COMMAND", "START");
        header.set("NBIT", 8);
        assert_eq!(header.del("COMMAND").as_deref(), Some("START"));
        assert_eq!(header.del("COMMAND"), None);
        assert_eq!(header.get::<u8>("NBIT").unwrap(), 8);
    }

    #[test]
    fn test_raw_round_trip() {
        let header = AsciiHeader::load_from_str(SAMPLE).unwrap();
        let reparsed = AsciiHeader::load_from_str(&header.raw()).unwrap();
        assert_eq!(header, reparsed);
    }

    #[test]
    fn test_load_from_bytes_ignores_padding() {
        let mut bytes = b"NCHAN 16\n".to_vec();
        bytes.resize(64, 0);
        let header = AsciiHeader::load_from_bytes(&bytes).unwrap();
        assert_eq!(header.get::<u32>("NCHAN").unwrap(), 16);
    }

    #[test]
    fn test_malformed_line() {
        assert!(matches!(
            AsciiHeader::load_from_str("NCHAN 16\nLONELY\n"),
            Err(HeaderError::Malformed { line: 2, .. })
        ));
    }
}
