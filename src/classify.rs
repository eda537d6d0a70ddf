//! Request classification: first-match-wins against a compiled rule list.

use crate::rule::Rule;

/// Lexically cleans a request path the way `path.Clean` does, while
/// enforcing a leading `/` and preserving a trailing `/` the original path
/// had. Query string and fragment are assumed already stripped by the
/// caller — classification only ever looks at the path component, per the
/// resolution of Open Question (a) in `SPEC_FULL.md` §4.4.
pub fn normalize_path(path: &str) -> String {
    let had_trailing_slash = path.ends_with('/') && path.len() > 1;

    let mut stack: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }

    let mut cleaned = String::from("/");
    cleaned.push_str(&stack.join("/"));
    if had_trailing_slash && cleaned != "/" {
        cleaned.push('/');
    }
    cleaned
}

/// Returns `true` iff some rule's method set contains `method` and its
/// anchored pattern fully matches the normalized `path`. A pure function of
/// its inputs: the same `(rules, method, path)` always classifies the same
/// way, with no side effects (logging is the caller's responsibility).
pub fn classify(rules: &[Rule], method: &str, path: &str) -> bool {
    let normalized = normalize_path(path);
    rules
        .iter()
        .any(|rule| rule.methods.contains(method) && rule.pattern.is_match(&normalized))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::build_rules;

    #[test]
    fn normalizes_dot_and_dotdot_segments() {
        assert_eq!(normalize_path("/a/./b/../c"), "/a/c");
        assert_eq!(normalize_path("a/b"), "/a/b");
        assert_eq!(normalize_path("/a/b/"), "/a/b/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/../.."), "/");
    }

    #[test]
    fn classify_is_a_pure_function() {
        let rules = build_rules(r"POST ~foo\+bar").unwrap();
        let a = classify(&rules, "POST", "~foo+bar");
        let b = classify(&rules, "POST", "~foo+bar");
        assert_eq!(a, b);
        assert!(a);
    }

    #[test]
    fn method_set_does_not_leak() {
        let rules = build_rules(r"GET,HEAD /x").unwrap();
        assert!(classify(&rules, "GET", "/x"));
        assert!(classify(&rules, "HEAD", "/x"));
        assert!(!classify(&rules, "POST", "/x"));
        assert!(!classify(&rules, "PUT", "/x"));
    }

    #[test]
    fn anchored_pattern_rejects_extra_chars() {
        let rules = build_rules(r"PUT /foo").unwrap();
        assert!(classify(&rules, "PUT", "/foo"));
        assert!(!classify(&rules, "PUT", "/foobar"));
        assert!(!classify(&rules, "PUT", "/xfoo"));
    }

    #[test]
    fn empty_rule_list_denies_everything() {
        let rules: Vec<Rule> = Vec::new();
        assert!(!classify(&rules, "GET", "/_ping"));
    }

    #[test]
    fn later_rule_can_still_allow_when_earlier_rule_does_not_match() {
        let rules = build_rules("GET /x\nGET,POST /x").unwrap();
        assert!(classify(&rules, "GET", "/x"));
        // The first rule doesn't cover POST, but iteration continues to the
        // second rule rather than stopping at the first non-match.
        assert!(classify(&rules, "POST", "/x"));
    }
}
