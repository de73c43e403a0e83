use globset::{Glob, GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use std::borrow::Cow;

/// Compile an ant-style path pattern: `*` and `?` stay within one path
/// segment, `**` spans any number of segments.
pub fn compile(pattern: &str) -> Result<GlobMatcher, globset::Error> {
    Ok(ant_glob(pattern)?.compile_matcher())
}

/// Compile a list of ant-style patterns into a single set.
pub fn compile_set<S: AsRef<str>>(patterns: &[S]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        builder.add(ant_glob(p.as_ref())?);
    }
    builder.build()
}

fn ant_glob(pattern: &str) -> Result<Glob, globset::Error> {
    GlobBuilder::new(pattern).literal_separator(true).build()
}

/// Number of literal characters in a pattern. Used to rank overlapping
/// patterns: the one with more literal text is the more specific.
pub fn specificity(pattern: &str) -> usize {
    pattern
        .chars()
        .filter(|c| !matches!(c, '*' | '?' | '[' | ']' | '{' | '}'))
        .count()
}

/// Canonical form of a request path: encoded separators (`%2f`, `%5c`)
/// treated as `/`, dot segments resolved (including their `%2e` spellings),
/// repeated slashes collapsed, `..` clamped at the root.
/// Patterns are matched against this form and it is what goes upstream.
pub fn normalize_path(path: &str) -> Cow<'_, str> {
    let canonical = path.starts_with('/')
        && !path.contains("//")
        && !has_encoded_separator(path)
        && !path.split('/').any(|seg| is_dot(seg) || is_dot_dot(seg));
    if canonical {
        return Cow::Borrowed(path);
    }

    let decoded = decode_separators(path);
    let path = decoded.as_str();
    let mut segments: Vec<&str> = Vec::new();
    let mut trailing_slash = false;
    for seg in path.split('/') {
        if seg.is_empty() || is_dot(seg) {
            trailing_slash = true;
        } else if is_dot_dot(seg) {
            segments.pop();
            trailing_slash = true;
        } else {
            segments.push(seg);
            trailing_slash = false;
        }
    }

    let mut out = String::with_capacity(path.len());
    for seg in &segments {
        out.push('/');
        out.push_str(seg);
    }
    if out.is_empty() || trailing_slash {
        out.push('/');
    }
    Cow::Owned(out)
}

const ENCODED_SEPARATORS: [&str; 2] = ["%2f", "%5c"];

fn has_encoded_separator(path: &str) -> bool {
    path.as_bytes().windows(3).any(|w| {
        ENCODED_SEPARATORS
            .iter()
            .any(|sep| w.eq_ignore_ascii_case(sep.as_bytes()))
    })
}

/// Replace `%2f`/`%5c` (any case) with `/`.
fn decode_separators(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = String::with_capacity(path.len());
    let mut start = 0;
    let mut i = 0;
    while i + 3 <= bytes.len() {
        let window = &bytes[i..i + 3];
        if ENCODED_SEPARATORS
            .iter()
            .any(|sep| window.eq_ignore_ascii_case(sep.as_bytes()))
        {
            out.push_str(&path[start..i]);
            out.push('/');
            i += 3;
            start = i;
        } else {
            i += 1;
        }
    }
    out.push_str(&path[start..]);
    out
}

fn is_dot(seg: &str) -> bool {
    seg == "." || seg.eq_ignore_ascii_case("%2e")
}

fn is_dot_dot(seg: &str) -> bool {
    ["..", ".%2e", "%2e.", "%2e%2e"]
        .iter()
        .any(|d| seg.eq_ignore_ascii_case(d))
}
