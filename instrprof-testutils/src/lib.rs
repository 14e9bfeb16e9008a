//! Test helpers for `instrprof`.
#![warn(missing_docs)]

use std::path::{Path, PathBuf};

/// Returns the full path to the specified fixture.
///
/// Fixtures are stored in the `instrprof-testutils/fixtures` directory and paths should be given
/// relative to that location.
///
/// # Example
///
/// ```
/// use instrprof_testutils::fixture;
///
/// let path = fixture("basic.proftext");
/// assert!(path.ends_with("basic.proftext"));
/// ```
pub fn fixture<P: AsRef<Path>>(path: P) -> PathBuf {
    let mut full_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    full_path.push("fixtures");
    full_path.push(path.as_ref());

    assert!(
        full_path.exists(),
        "Fixture does not exist: {}",
        full_path.display()
    );

    full_path
}

/// Reads the contents of the specified fixture into memory.
///
/// Panics if the fixture does not exist or cannot be read.
pub fn fixture_bytes<P: AsRef<Path>>(path: P) -> Vec<u8> {
    let path = fixture(path);
    match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) => panic!("Failed to read fixture {}: {e}", path.display()),
    }
}
