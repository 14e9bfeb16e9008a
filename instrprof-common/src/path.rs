/// Returns `true` if the given byte is any valid directory separator.
#[inline]
fn is_path_separator(c: char) -> bool {
    matches!(c, '\\' | '/')
}

/// Returns `true` if this is an absolute Windows path, either UNC or starting with a drive letter.
fn is_absolute_windows_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    if bytes.starts_with(b"\\\\") || bytes.starts_with(b"//") {
        return true;
    }

    match (bytes.first(), bytes.get(1)) {
        (Some(letter), Some(b':')) if letter.is_ascii_alphabetic() => bytes
            .get(2)
            .map_or(true, |&c| is_path_separator(char::from(c))),
        _ => false,
    }
}

fn is_windows_path(path: &str) -> bool {
    is_absolute_windows_path(path) || path.contains('\\')
}

/// Returns `true` if the path is absolute on either Unix or Windows.
pub fn is_absolute_path(path: &str) -> bool {
    path.starts_with('/') || is_absolute_windows_path(path)
}

/// Resolves a source file name recorded in a coverage mapping against the compilation directory.
///
/// Absolute names are returned unchanged, as is every name when the compilation directory is empty.
/// The separator is picked from the style of the inputs, so mappings produced on Windows hosts keep
/// their backslashes.
///
/// # Examples
///
/// ```
/// use instrprof_common::join_path;
///
/// assert_eq!(join_path("/build", "src/main.c"), "/build/src/main.c");
/// assert_eq!(join_path("/build/", "/usr/include/stdio.h"), "/usr/include/stdio.h");
/// assert_eq!(join_path("C:\\build", "src\\main.c"), "C:\\build\\src\\main.c");
/// ```
pub fn join_path(base: &str, other: &str) -> String {
    if base.is_empty() || is_absolute_path(other) {
        return other.into();
    }

    if other.is_empty() {
        return base.into();
    }

    let separator = if is_windows_path(base) || is_windows_path(other) {
        '\\'
    } else {
        '/'
    };

    format!(
        "{}{}{}",
        base.trim_end_matches(is_path_separator),
        separator,
        other.trim_start_matches(is_path_separator)
    )
}
