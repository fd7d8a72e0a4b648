use std::path::Path;
use tracing::debug;

/// Fields of interest from `<usr>/lib/os-release`.
///
/// Absence of the file, or failure to parse a line, leaves everything at
/// its default: an unidentified runtime gets no special-casing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    pub id: Option<String>,
    pub version_id: Option<String>,
}

impl OsRelease {
    pub fn probe(usr_root: &Path) -> Self {
        let path = usr_root.join("lib/os-release");
        match std::fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no os-release");
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Self {
        let mut info = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value
                .trim()
                .trim_matches('"')
                .trim_matches('\'')
                .to_owned();
            match key.trim() {
                "ID" => info.id = Some(value),
                "VERSION_ID" => info.version_id = Some(value),
                _ => {}
            }
        }
        info
    }

    /// Whether this is the first-generation Steam runtime, which predates
    /// merged `/usr` and needs legacy compatibility behavior.
    pub fn is_legacy_steamrt(&self) -> bool {
        self.id.as_deref() == Some("steamrt") && self.version_id.as_deref() == Some("1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_id_and_version() {
        let info = OsRelease::parse(
            "NAME=\"Steam Runtime\"\nID=steamrt\nID_LIKE=ubuntu\nVERSION_ID=\"2\"\n",
        );
        assert_eq!(info.id.as_deref(), Some("steamrt"));
        assert_eq!(info.version_id.as_deref(), Some("2"));
        assert!(!info.is_legacy_steamrt());
    }

    #[test]
    fn legacy_runtime_detected() {
        let info = OsRelease::parse("ID=steamrt\nVERSION_ID=1\n");
        assert!(info.is_legacy_steamrt());
    }

    #[test]
    fn garbage_lines_are_ignored() {
        let info = OsRelease::parse("# comment\n\nnot a key value\nID=arch\n");
        assert_eq!(info.id.as_deref(), Some("arch"));
        assert_eq!(info.version_id, None);
    }

    #[test]
    fn probe_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(OsRelease::probe(dir.path()), OsRelease::default());
    }

    #[test]
    fn probe_reads_lib_os_release() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib/os-release"), "ID=debian\n").unwrap();
        let info = OsRelease::probe(dir.path());
        assert_eq!(info.id.as_deref(), Some("debian"));
    }
}
