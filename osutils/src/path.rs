use std::path::{Path, PathBuf};

/// Joins two paths, treating the second as relative even when it is absolute.
/// `join_relative("/mnt/target", "/efi")` yields `/mnt/target/efi`.
pub fn join_relative(base: impl AsRef<Path>, path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    base.as_ref()
        .join(path.strip_prefix("/").unwrap_or(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_relative() {
        assert_eq!(
            join_relative("/mnt/target", "/efi"),
            PathBuf::from("/mnt/target/efi")
        );
        assert_eq!(
            join_relative("/mnt/target", "efi"),
            PathBuf::from("/mnt/target/efi")
        );
        assert_eq!(join_relative("/", "/"), PathBuf::from("/"));
    }
}
