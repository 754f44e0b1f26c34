use std::path::Path;

/// Ignore errors about nonexisting directories.
pub fn exist_then_read_dir<A: AsRef<Path>>(
    p: A,
) -> std::io::Result<Box<dyn Iterator<Item = std::fs::DirEntry>>> {
    match std::fs::read_dir(p) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Box::new(std::iter::empty())),
        Err(e) => Err(e),
        Ok(x) => Ok(Box::new(x.flatten())),
    }
}

/// Sorted entry names of a directory, with a trailing `/` on subdirectories.
///
/// A missing directory has no entries.
///
/// # Errors
/// The directory exists but cannot be read.
pub fn list_dir_names<A: AsRef<Path>>(p: A) -> std::io::Result<Vec<String>> {
    let mut names: Vec<String> = exist_then_read_dir(p)?
        .map(|entry| {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().is_ok_and(|t| t.is_dir()) {
                name.push('/');
            }
            name
        })
        .collect();
    names.sort_unstable();
    Ok(names)
}
