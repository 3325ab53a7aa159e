use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

/// Atomically creates a file with the given contents, overwriting
/// it if one exists.
///
/// The buffer is first written to a temporary file in the same directory
/// and then synced and renamed into place, so readers either see the old
/// contents or the complete new contents, never a partial write.
pub fn safe_write_all<P: AsRef<Path>, B: AsRef<[u8]>>(path: P, buf: B) -> io::Result<()> {
    let tmp_ext = format!("sync-{}", std::process::id());
    let tmp_path = path.as_ref().with_extension(tmp_ext);
    let mut tmp_file = File::create(&tmp_path)?;

    tmp_file.write_all(buf.as_ref())?;
    tmp_file.flush()?;
    tmp_file.sync_all()?;
    drop(tmp_file);

    fs::rename(&tmp_path, path.as_ref())
}

/// Ensures that a directory and all of its parents exist.
///
/// Returns an error only if the directory could not be created and does
/// not already exist.
pub fn ensure_exists<P: AsRef<Path>>(dir: P) -> io::Result<()> {
    let dir = dir.as_ref();
    match fs::create_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) => {
            // create_dir_all can race with a concurrent mkdir; check whether
            // the directory is there before reporting the failure.
            if fs::exists(dir).unwrap_or(false) {
                Ok(())
            } else {
                Err(err)
            }
        }
    }
}
