use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::debug;

/// Workspaces, archives, logs and cid sidecars live under this root rather
/// than the ambient temp dir: Docker for Mac shares `/tmp` by default but not
/// `/var/folders`, and a workspace that cannot be bind-mounted is useless.
pub const DEFAULT_SCRATCH_ROOT: &str = "/tmp";

/// Extract an archive into a fresh directory under `scratch_root` and return
/// its path. The caller owns the directory. On any extraction error the
/// partial directory is removed before returning.
pub fn extract_archive(archive: &Path, scratch_root: &Path, prefix: &str) -> Result<PathBuf> {
    let dir = tempfile::Builder::new()
        .prefix(&format!("{prefix}."))
        .tempdir_in(scratch_root)
        .with_context(|| format!("create workspace dir under {}", scratch_root.display()))?
        .keep();

    match unzip_into(archive, &dir) {
        Ok(entries) => {
            debug!(dir = %dir.display(), entries, "archive extracted");
            Ok(dir)
        }
        Err(e) => {
            let _ = fs::remove_dir_all(&dir);
            Err(e)
        }
    }
}

fn unzip_into(archive: &Path, dest: &Path) -> Result<usize> {
    let file = fs::File::open(archive)
        .with_context(|| format!("open archive {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file).context("read zip archive")?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).context("read zip entry")?;

        // Zip-slip defense: reject entries whose resolved path would land
        // outside the destination.
        let Some(rel) = entry.enclosed_name() else {
            bail!("{}: illegal file path", entry.name());
        };
        let target = dest.join(rel);

        if entry.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("create directory {}", target.display()))?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut out = fs::File::create(&target)
            .with_context(|| format!("create file {}", target.display()))?;
        io::copy(&mut entry, &mut out)
            .with_context(|| format!("copying {:?} failed", entry.name()))?;

        if let Some(mode) = entry.unix_mode() {
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o777))
                .with_context(|| format!("set permissions on {}", target.display()))?;
        }
    }

    Ok(zip.len())
}

/// Turn an extracted tree into a local git repository whose initial commit
/// contains every file, so the final diff is well-defined.
pub async fn init_clean_tree(dir: &Path) -> Result<()> {
    run_git(dir, &["init"]).await.context("git init failed")?;
    // Scratch trees have no ambient identity; commits fail without one.
    run_git(dir, &["config", "user.name", "armada"]).await?;
    run_git(dir, &["config", "user.email", "armada@localhost"]).await?;
    // --force: files the source repository gitignores still belong in the
    // baseline, otherwise step output touching them never shows up.
    run_git(dir, &["add", "--force", "--all"])
        .await
        .context("git add failed")?;
    run_git(dir, &["commit", "--quiet", "--all", "-m", "armada-exec"])
        .await
        .context("git commit failed")?;
    Ok(())
}

/// Stage everything and return the diff against the initial commit: unified,
/// no `a/`/`b/` prefixes, binary hunks inlined. This is the wire format the
/// backend consumes.
pub async fn staged_diff(dir: &Path) -> Result<Vec<u8>> {
    run_git(dir, &["add", "--all"])
        .await
        .context("git add failed")?;
    run_git(dir, &["diff", "--cached", "--no-prefix", "--binary"])
        .await
        .context("git diff failed")
}

async fn run_git(dir: &Path, args: &[&str]) -> Result<Vec<u8>> {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("run 'git {}'", args.join(" ")))?;
    if !out.status.success() {
        bail!(
            "'git {}' failed: {}{}",
            args.join(" "),
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        );
    }
    Ok(out.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn make_zip(entries: &[(&str, &str, Option<u32>)]) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut zw = ZipWriter::new(file.reopen().unwrap());
        for (name, contents, mode) in entries {
            let mut opts = SimpleFileOptions::default();
            if let Some(mode) = mode {
                opts = opts.unix_permissions(*mode);
            }
            if name.ends_with('/') {
                zw.add_directory(name.to_string(), opts).unwrap();
            } else {
                zw.start_file(name.to_string(), opts).unwrap();
                zw.write_all(contents.as_bytes()).unwrap();
            }
        }
        zw.finish().unwrap();
        file
    }

    #[test]
    fn extracts_files_directories_and_modes() {
        let scratch = tempfile::tempdir().unwrap();
        let zip = make_zip(&[
            ("README.md", "hello\n", None),
            ("nested/dir/", "", None),
            ("nested/dir/data.txt", "42\n", None),
            ("run.sh", "#!/bin/sh\n", Some(0o755)),
        ]);

        let dir = extract_archive(zip.path(), scratch.path(), "changeset-acme").unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.join("README.md")).unwrap(),
            "hello\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.join("nested/dir/data.txt")).unwrap(),
            "42\n"
        );
        let mode = std::fs::metadata(dir.join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111, "executable bit lost: {mode:o}");

        std::fs::remove_dir_all(dir).unwrap();
    }

    /// Rewrite an entry name in a finished archive. The replacement must have
    /// the same length so header offsets stay valid; names carry no checksum.
    fn patch_entry_name(zip: &tempfile::NamedTempFile, from: &str, to: &str) {
        assert_eq!(from.len(), to.len());
        let (from, to) = (from.as_bytes(), to.as_bytes());
        let mut bytes = std::fs::read(zip.path()).unwrap();
        let mut found = false;
        for i in 0..=bytes.len().saturating_sub(from.len()) {
            if &bytes[i..i + from.len()] == from {
                bytes[i..i + from.len()].copy_from_slice(to);
                found = true;
            }
        }
        assert!(found, "entry name not found in archive");
        std::fs::write(zip.path(), &bytes).unwrap();
    }

    #[test]
    fn rejects_parent_traversal_and_cleans_up() {
        let scratch = tempfile::tempdir().unwrap();
        let zip = make_zip(&[("XX/evil", "boom", None)]);
        patch_entry_name(&zip, "XX/evil", "../evil");

        let err = extract_archive(zip.path(), scratch.path(), "changeset-acme").unwrap_err();
        assert!(format!("{err}").contains("illegal file path"), "{err}");

        // The partially-created workspace must be gone.
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn rejects_absolute_paths() {
        let scratch = tempfile::tempdir().unwrap();
        let zip = make_zip(&[("Xetc/evil", "boom", None)]);
        patch_entry_name(&zip, "Xetc/evil", "/etc/evil");

        let err = extract_archive(zip.path(), scratch.path(), "changeset-acme").unwrap_err();
        assert!(format!("{err}").contains("illegal file path"), "{err}");
    }

    #[tokio::test]
    async fn initial_commit_covers_ignored_files_and_diff_sees_new_ones() {
        let scratch = tempfile::tempdir().unwrap();
        let zip = make_zip(&[
            (".gitignore", "secret.txt\n", None),
            ("secret.txt", "ignored but committed\n", None),
            ("src/main.txt", "v1\n", None),
        ]);
        let dir = extract_archive(zip.path(), scratch.path(), "changeset-acme").unwrap();

        init_clean_tree(&dir).await.unwrap();

        // Baseline includes the ignored file, so an untouched tree is empty.
        let diff = staged_diff(&dir).await.unwrap();
        assert!(diff.is_empty(), "{}", String::from_utf8_lossy(&diff));

        std::fs::write(dir.join("created.txt"), "created\n").unwrap();
        std::fs::write(dir.join("src/main.txt"), "v2\n").unwrap();

        let diff = String::from_utf8(staged_diff(&dir).await.unwrap()).unwrap();
        assert!(diff.contains("created.txt"), "{diff}");
        assert!(diff.contains("+created"), "{diff}");
        // --no-prefix output references bare paths.
        assert!(diff.contains("diff --git src/main.txt src/main.txt"), "{diff}");
        assert!(!diff.contains("a/src/main.txt"), "{diff}");

        std::fs::remove_dir_all(dir).unwrap();
    }
}
