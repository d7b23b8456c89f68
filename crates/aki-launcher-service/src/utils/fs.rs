use std::io;
use std::path::Path;

/// Runs `f`, mapping an [`io::ErrorKind::NotFound`] error to `Ok(None)`.
pub fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

/// Deletes `dir` with all its contents and creates it again, empty.
pub fn recreate_dir(dir: &Path) -> io::Result<()> {
    catch_not_found(|| std::fs::remove_dir_all(dir))?;
    std::fs::create_dir_all(dir)
}
