use crate::RuntimeError;
use std::collections::HashMap;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use tracing::debug;

/// Top-level names that a merged-`/usr` layout replaces with symlinks into
/// `usr/`.
const USRMERGE_NAMES: &[&str] = &["bin", "etc", "sbin", "var"];

/// Recursively copy `source` into `dest`, preserving hard links between
/// files inside the tree and normalizing permissions (directories 0755,
/// files 0755 or 0644 depending on owner-execute).
///
/// Symlinks are recreated with their literal targets; ownership is not
/// preserved (copies belong to the invoking user).
pub fn copy_tree(source: &Path, dest: &Path) -> Result<(), RuntimeError> {
    let mut seen: HashMap<(u64, u64), std::path::PathBuf> = HashMap::new();
    copy_dir(source, dest, &mut seen)
}

fn copy_dir(
    source: &Path,
    dest: &Path,
    seen: &mut HashMap<(u64, u64), std::path::PathBuf>,
) -> Result<(), RuntimeError> {
    std::fs::create_dir_all(dest).map_err(|e| RuntimeError::io(dest, e))?;
    std::fs::set_permissions(dest, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| RuntimeError::io(dest, e))?;

    let reader = std::fs::read_dir(source).map_err(|e| RuntimeError::io(source, e))?;
    for entry in reader {
        let entry = entry.map_err(|e| RuntimeError::io(source, e))?;
        let src = entry.path();
        let dst = dest.join(entry.file_name());
        let meta = std::fs::symlink_metadata(&src).map_err(|e| RuntimeError::io(&src, e))?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            copy_dir(&src, &dst, seen)?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(&src).map_err(|e| RuntimeError::io(&src, e))?;
            std::os::unix::fs::symlink(&target, &dst).map_err(|e| RuntimeError::io(&dst, e))?;
        } else if file_type.is_file() {
            let identity = (meta.dev(), meta.ino());
            if meta.nlink() > 1 {
                if let Some(first) = seen.get(&identity) {
                    std::fs::hard_link(first, &dst)
                        .map_err(|e| RuntimeError::io(&dst, e))?;
                    continue;
                }
                seen.insert(identity, dst.clone());
            }
            std::fs::copy(&src, &dst).map_err(|e| RuntimeError::io(&dst, e))?;
            let mode = if meta.mode() & 0o100 != 0 { 0o755 } else { 0o644 };
            std::fs::set_permissions(&dst, std::fs::Permissions::from_mode(mode))
                .map_err(|e| RuntimeError::io(&dst, e))?;
        } else {
            // Sockets, fifos, devices: a runtime tree should not contain
            // them, and a copy certainly must not.
            debug!(path = %src.display(), "skipping special file");
        }
    }
    Ok(())
}

/// Normalize `root` into a merged-`/usr` layout: any of `bin`, `etc`,
/// `lib*`, `sbin`, `var` that exist as real directories are renamed into
/// `usr/`, and top-level symlinks into `usr/` are created for every such
/// name that `usr/` actually contains.
pub fn normalize_usrmerge(root: &Path) -> Result<(), RuntimeError> {
    let usr = root.join("usr");
    std::fs::create_dir_all(&usr).map_err(|e| RuntimeError::io(&usr, e))?;

    let mut names: Vec<String> = USRMERGE_NAMES.iter().map(|s| (*s).to_owned()).collect();
    // lib, lib32, lib64, libexec, ... whatever the tree has.
    for dir in [root, usr.as_path()] {
        if let Ok(reader) = std::fs::read_dir(dir) {
            for entry in reader.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with("lib") && !names.contains(&name) {
                    names.push(name);
                }
            }
        }
    }

    for name in &names {
        let top = root.join(name);
        let merged = usr.join(name);

        match std::fs::symlink_metadata(&top) {
            Ok(meta) if meta.is_dir() => {
                if merged.exists() {
                    // Both exist: the tree is already partially merged;
                    // leave the real directories alone.
                    continue;
                }
                std::fs::rename(&top, &merged).map_err(|e| RuntimeError::io(&top, e))?;
                std::os::unix::fs::symlink(Path::new("usr").join(name), &top)
                    .map_err(|e| RuntimeError::io(&top, e))?;
            }
            Ok(_) => {} // already a symlink or a stray file
            Err(_) => {
                if merged.is_dir() {
                    std::os::unix::fs::symlink(Path::new("usr").join(name), &top)
                        .map_err(|e| RuntimeError::io(&top, e))?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn copies_files_symlinks_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("lib")).unwrap();
        std::fs::write(src.join("lib/libz.so.1.2"), b"z").unwrap();
        symlink("libz.so.1.2", src.join("lib/libz.so.1")).unwrap();

        let dst = dir.path().join("dst");
        copy_tree(&src, &dst).unwrap();

        assert_eq!(std::fs::read(dst.join("lib/libz.so.1.2")).unwrap(), b"z");
        assert_eq!(
            std::fs::read_link(dst.join("lib/libz.so.1")).unwrap(),
            Path::new("libz.so.1.2")
        );
    }

    #[test]
    fn preserves_hard_links_within_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a"), b"content").unwrap();
        std::fs::hard_link(src.join("a"), src.join("b")).unwrap();

        let dst = dir.path().join("dst");
        copy_tree(&src, &dst).unwrap();

        let a = std::fs::metadata(dst.join("a")).unwrap();
        let b = std::fs::metadata(dst.join("b")).unwrap();
        assert_eq!(a.ino(), b.ino());
        // And not linked back to the source.
        let src_a = std::fs::metadata(src.join("a")).unwrap();
        assert_ne!(a.ino(), src_a.ino());
    }

    #[test]
    fn normalizes_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("script"), b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(
            src.join("script"),
            std::fs::Permissions::from_mode(0o700),
        )
        .unwrap();
        std::fs::write(src.join("data"), b"d").unwrap();
        std::fs::set_permissions(src.join("data"), std::fs::Permissions::from_mode(0o600))
            .unwrap();

        let dst = dir.path().join("dst");
        copy_tree(&src, &dst).unwrap();

        let script = std::fs::metadata(dst.join("script")).unwrap();
        assert_eq!(script.permissions().mode() & 0o777, 0o755);
        let data = std::fs::metadata(dst.join("data")).unwrap();
        assert_eq!(data.permissions().mode() & 0o777, 0o644);
    }

    #[test]
    fn usrmerge_renames_real_dirs_and_links_them() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bin")).unwrap();
        std::fs::write(dir.path().join("bin/sh"), b"").unwrap();
        std::fs::create_dir_all(dir.path().join("usr")).unwrap();

        normalize_usrmerge(dir.path()).unwrap();

        assert!(dir.path().join("usr/bin/sh").is_file());
        assert_eq!(
            std::fs::read_link(dir.path().join("bin")).unwrap(),
            Path::new("usr/bin")
        );
    }

    #[test]
    fn usrmerge_links_existing_usr_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("usr/lib/x86_64-linux-gnu")).unwrap();
        std::fs::create_dir_all(dir.path().join("usr/lib64")).unwrap();

        normalize_usrmerge(dir.path()).unwrap();

        assert_eq!(
            std::fs::read_link(dir.path().join("lib")).unwrap(),
            Path::new("usr/lib")
        );
        assert_eq!(
            std::fs::read_link(dir.path().join("lib64")).unwrap(),
            Path::new("usr/lib64")
        );
        // Nothing to link for names usr/ does not contain.
        assert!(!dir.path().join("sbin").exists());
    }
}
