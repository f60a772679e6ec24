//! Dot-separated action strings.
//!
//! An action such as `api.app.echo` names a handler inside a namespace tree.
//! Routing resolves the longest registered prefix, so [`prefixes`] yields
//! candidates from most to least specific.

/// Segment separator.
pub const SEPARATOR: char = '.';

/// Iterate over an action's prefixes, longest first.
///
/// `"api.app.echo"` yields `"api.app.echo"`, `"api.app"`, `"api"`.
#[must_use]
pub fn prefixes(action: &str) -> Prefixes<'_> {
    Prefixes {
        rest: (!action.is_empty()).then_some(action),
    }
}

/// Iterator returned by [`prefixes`].
#[derive(Debug, Clone)]
pub struct Prefixes<'a> {
    rest: Option<&'a str>,
}

impl<'a> Iterator for Prefixes<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let current = self.rest?;
        self.rest = current.rfind(SEPARATOR).map(|idx| &current[..idx]);
        Some(current)
    }
}

/// The leading segment of an action.
#[must_use]
pub fn namespace(action: &str) -> &str {
    action.split(SEPARATOR).next().unwrap_or(action)
}

/// Whether `action` is well formed: non-empty segments of
/// `[A-Za-z0-9_-]` joined by dots.
#[must_use]
pub fn is_valid(action: &str) -> bool {
    !action.is_empty()
        && action.split(SEPARATOR).all(|seg| {
            !seg.is_empty()
                && seg
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        })
}
