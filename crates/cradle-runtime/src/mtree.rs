use crate::RuntimeError;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Entry kinds a file manifest can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestEntryKind {
    File,
    Dir,
    Link,
}

/// One line of a file manifest.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub path: PathBuf,
    pub kind: ManifestEntryKind,
    pub mode: Option<u32>,
    pub size: Option<u64>,
    pub sha256: Option<String>,
    pub link_target: Option<PathBuf>,
}

/// A parsed file manifest listing every entry of the runtime's merged
/// `/usr` tree with content hashes, in mtree style:
///
/// ```text
/// ./bin/env type=file mode=755 size=5 sha256=deadbeef
/// ./lib/libz.so.1 type=link link=libz.so.1.2.11
/// ```
///
/// Having one allows a mutable copy to be populated without a full
/// recursive walk of the source tree.
#[derive(Debug, Default)]
pub struct FileManifest {
    entries: Vec<ManifestEntry>,
}

impl FileManifest {
    /// Read a manifest file, transparently decompressing a `.gz` name.
    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let file = File::open(path).map_err(|e| RuntimeError::io(path, e))?;
        let mut content = String::new();
        if path.extension().is_some_and(|e| e == "gz") {
            GzDecoder::new(file)
                .read_to_string(&mut content)
                .map_err(|e| RuntimeError::io(path, e))?;
        } else {
            let mut file = file;
            file.read_to_string(&mut content)
                .map_err(|e| RuntimeError::io(path, e))?;
        }
        Self::parse(&content, path)
    }

    pub fn parse(content: &str, origin: &Path) -> Result<Self, RuntimeError> {
        let bad = |line: usize, message: &str| RuntimeError::BadManifest {
            path: origin.to_owned(),
            line,
            message: message.to_owned(),
        };

        let mut entries = Vec::new();
        for (idx, raw) in content.lines().enumerate() {
            let lineno = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let path = fields.next().ok_or_else(|| bad(lineno, "empty entry"))?;
            let path = PathBuf::from(path.strip_prefix("./").unwrap_or(path));
            if path.as_os_str().is_empty() {
                continue;
            }

            let mut kind = None;
            let mut mode = None;
            let mut size = None;
            let mut sha256 = None;
            let mut link_target = None;
            for field in fields {
                let Some((key, value)) = field.split_once('=') else {
                    return Err(bad(lineno, "field without '='"));
                };
                match key {
                    "type" => {
                        kind = Some(match value {
                            "file" => ManifestEntryKind::File,
                            "dir" => ManifestEntryKind::Dir,
                            "link" => ManifestEntryKind::Link,
                            _ => return Err(bad(lineno, "unknown entry type")),
                        });
                    }
                    "mode" => {
                        mode = Some(
                            u32::from_str_radix(value, 8)
                                .map_err(|_| bad(lineno, "mode is not octal"))?,
                        );
                    }
                    "size" => {
                        size = Some(
                            value
                                .parse::<u64>()
                                .map_err(|_| bad(lineno, "size is not a number"))?,
                        );
                    }
                    "sha256" => sha256 = Some(value.to_owned()),
                    "link" => link_target = Some(PathBuf::from(value)),
                    // Forward compatibility: unknown keywords are skipped.
                    _ => {}
                }
            }

            let kind = kind.ok_or_else(|| bad(lineno, "missing type="))?;
            if kind == ManifestEntryKind::Link && link_target.is_none() {
                return Err(bad(lineno, "link entry without link="));
            }

            entries.push(ManifestEntry {
                path,
                kind,
                mode,
                size,
                sha256,
                link_target,
            });
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Materialize the manifest under `dest_root`, sourcing file content
    /// from `source_root`. Files are hard-linked from the source when their
    /// size matches the manifest (content-addressed trees make this safe),
    /// copied otherwise.
    pub fn apply(&self, source_root: &Path, dest_root: &Path) -> Result<(), RuntimeError> {
        for entry in &self.entries {
            let dest = dest_root.join(&entry.path);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(|e| RuntimeError::io(parent, e))?;
            }

            match entry.kind {
                ManifestEntryKind::Dir => {
                    std::fs::create_dir_all(&dest).map_err(|e| RuntimeError::io(&dest, e))?;
                    if let Some(mode) = entry.mode {
                        set_mode(&dest, mode)?;
                    }
                }
                ManifestEntryKind::Link => {
                    // Parsing rejects link entries without a target.
                    let Some(target) = &entry.link_target else {
                        continue;
                    };
                    std::os::unix::fs::symlink(target, &dest)
                        .map_err(|e| RuntimeError::io(&dest, e))?;
                }
                ManifestEntryKind::File => {
                    let source = source_root.join(&entry.path);
                    let meta = std::fs::symlink_metadata(&source)
                        .map_err(|_| RuntimeError::MissingManifestSource(source.clone()))?;

                    let sizes_agree = entry.size.is_none_or(|s| s == meta.len());
                    let linked = sizes_agree && std::fs::hard_link(&source, &dest).is_ok();
                    if !linked {
                        debug!(path = %entry.path.display(), "copying instead of hard-linking");
                        std::fs::copy(&source, &dest)
                            .map_err(|e| RuntimeError::io(&dest, e))?;
                    }
                    if let Some(mode) = entry.mode {
                        set_mode(&dest, mode)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<(), RuntimeError> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| RuntimeError::io(path, e))
}
