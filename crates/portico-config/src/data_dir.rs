use std::path::PathBuf;

/// Resolve the data directory: explicit flag, `PORTICO_DATA_DIR`, or
/// `./data` next to the working directory. The directory is created if
/// missing.
pub fn resolve(explicit: Option<PathBuf>) -> Result<PathBuf, anyhow::Error> {
    let dir = explicit
        .or_else(|| std::env::var_os("PORTICO_DATA_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("data"));
    std::fs::create_dir_all(&dir)?;
    Ok(dir.canonicalize()?)
}

#[cfg(test)]
mod tests {
    use super::resolve;

    #[test]
    fn explicit_dir_is_created_and_canonicalized() {
        let temp = std::env::temp_dir().join(format!("portico-test-{}", std::process::id()));
        let dir = resolve(Some(temp.join("nested"))).unwrap();
        assert!(dir.is_absolute());
        assert!(dir.exists());
        let _ = std::fs::remove_dir_all(&temp);
    }
}
