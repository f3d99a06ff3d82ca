use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Every regular file below `root`, sorted.
pub fn files_below(root: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!("{}/**/*", glob::Pattern::escape(&root.to_string_lossy()));
    let mut files = Vec::new();
    for entry in glob::glob(&pattern).context("invalid directory pattern")? {
        let path = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// `file` relative to `root`, with `/` separators on every platform.
pub fn relative_slash_path(file: &Path, root: &Path) -> Result<String> {
    let relative = file
        .strip_prefix(root)
        .with_context(|| format!("{} is not below {}", file.display(), root.display()))?;
    Ok(relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn walks_nested_files_only() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("model/config")).unwrap();
        std::fs::write(tmp.path().join("model/weights.bin"), b"w").unwrap();
        std::fs::write(tmp.path().join("model/config/params.json"), b"{}").unwrap();

        let files = files_below(tmp.path()).unwrap();
        let relative: Vec<String> = files
            .iter()
            .map(|file| relative_slash_path(file, tmp.path()).unwrap())
            .collect();
        assert_eq!(relative, vec!["model/config/params.json", "model/weights.bin"]);
    }

    #[test]
    fn file_outside_root_is_an_error() {
        assert!(relative_slash_path(Path::new("/a/b"), Path::new("/c")).is_err());
    }
}
