//! Build-output detection
//!
//! A project counts as built when its build output directory exists and holds
//! at least one file somewhere below it. This is a heuristic: stale output from
//! an older build also counts.

use std::path::Path;

use walkdir::WalkDir;

pub fn has_build_output(project_dir: &Path, output_dir: &str) -> bool {
    let dir = project_dir.join(output_dir);
    if !dir.is_dir() {
        return false;
    }

    WalkDir::new(&dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .any(|entry| entry.file_type().is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_output_dir_is_not_built() {
        let dir = TempDir::new().unwrap();
        assert!(!has_build_output(dir.path(), "bin"));
    }

    #[test]
    fn test_empty_output_dirs_are_not_built() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("bin/Debug/net8.0")).unwrap();
        assert!(!has_build_output(dir.path(), "bin"));
    }

    #[test]
    fn test_nested_artifact_counts_as_built() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("bin/Debug/net8.0");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("app.dll"), b"MZ").unwrap();
        assert!(has_build_output(dir.path(), "bin"));
        assert!(!has_build_output(dir.path(), "dist"));
    }
}
