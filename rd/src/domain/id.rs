//! Loop ID generation and name sanitization
//!
//! Loop IDs are uuid-v7 strings; branch and worktree names embed a sanitized
//! loop name plus the first 8 characters of the ID.

/// Generate a new loop ID
pub fn new_loop_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// First 8 characters of a loop ID, used in branch names
pub fn short_id(id: &str) -> &str {
    if id.len() >= 8 { &id[..8] } else { id }
}

/// Sanitize a loop name for use in branch names and worktree directories
///
/// Lower-cases, strips apostrophes, replaces every other non-alphanumeric
/// run with a single hyphen.
pub fn sanitize_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() {
                Some(c)
            } else if c == '\'' || c == '\u{2019}' || c == '\u{2018}' {
                None
            } else {
                Some('-')
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_loop_id_unique() {
        let a = new_loop_id();
        let b = new_loop_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0194a2f3-1234-7890-abcd-ef0123456789"), "0194a2f3");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_sanitize_name_basic() {
        assert_eq!(sanitize_name("Fix the Login Bug"), "fix-the-login-bug");
    }

    #[test]
    fn test_sanitize_name_strips_apostrophes() {
        assert_eq!(sanitize_name("Don't break CI"), "dont-break-ci");
    }

    #[test]
    fn test_sanitize_name_collapses_runs() {
        assert_eq!(sanitize_name("a  --  b!!c"), "a-b-c");
        assert_eq!(sanitize_name("  leading/trailing  "), "leading-trailing");
    }
}
