//! Rule DSL compiler: `(method-list, pattern)` lines expanding `%NAME%`
//! variables to a fixpoint before being anchored and compiled as regexes.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::RuleError;

static COMMENT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\t ]*(!.*)?$").expect("comment line regex"));

static RULE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\t ]*([A-Z]+(?:,[A-Z]+)*)[\t ]+(.+?)[\t ]*$").expect("rule line regex")
});

static NEWLINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\r?\n").expect("newline regex"));

/// Built-in rules always compiled unless the operator disables them.
pub const RAW_DEFAULT_RULES: &[&str] = &[
    "GET,HEAD %API_PREFIX_PING%",
    "GET %API_PREFIX_VERSION%",
    "GET %API_PREFIX_INFO%",
];

/// A single compiled rule: the set of methods it applies to and the
/// anchored pattern its path must fully match.
#[derive(Debug, Clone)]
pub struct Rule {
    pub methods: BTreeSet<String>,
    pub pattern: Regex,
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.methods == other.methods && self.pattern.as_str() == other.pattern.as_str()
    }
}
impl Eq for Rule {}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let methods: Vec<&str> = self.methods.iter().map(String::as_str).collect();
        write!(f, "{} {}", methods.join(","), self.pattern.as_str())
    }
}

static VARIABLES: LazyLock<std::collections::HashMap<&'static str, String>> =
    LazyLock::new(build_variable_table);

fn raw_variable_table() -> Vec<(&'static str, &'static str)> {
    vec![
        ("HOST", r"(?:[a-zA-Z0-9][a-zA-Z0-9_.-]*)"),
        ("IPV4", r"(?:[0-9]{1,3}(?:\.[0-9]{1,3}){3})"),
        ("IPV6", r"(?:\[[a-fA-F0-9]{0,4}(?::[a-fA-F0-9]{0,4}){2,7}\])"),
        ("IP", r"(?:%IPV4%|%IPV6%)"),
        ("HOST_OR_IP", r"(?:%HOST%|%IP%)"),
        ("HOST_OR_IP_WITH_PORT", r"(?:%HOST_OR_IP%(?::[0-9]+)?)"),
        ("IMAGE_ID", r"(?:(?:[a-zA-Z0-9_-]+:)?[a-fA-F0-9]+)"),
        ("IMAGE_COMPONENT", r"(?:[a-zA-Z0-9][a-zA-Z0-9_.-]*)"),
        ("IMAGE_TAG", r"(?:[a-zA-Z0-9_][a-zA-Z0-9_.-]{0,127})"),
        (
            "IMAGE_NAME",
            r"(?:(?:%HOST_OR_IP_WITH_PORT%)?(?:/%IMAGE_COMPONENT%)+(?::%IMAGE_TAG%)?)",
        ),
        ("IMAGE_ID_OR_NAME", r"(?:%IMAGE_ID%|%IMAGE_NAME%)"),
        ("CONTAINER_ID", r"(?:[a-fA-F0-9]+)"),
        ("CONTAINER_NAME", r"(?:[a-zA-Z0-9][a-zA-Z0-9_.-]+)"),
        (
            "CONTAINER_ID_OR_NAME",
            r"(?:%CONTAINER_ID%|%CONTAINER_NAME%)",
        ),
        ("VOLUME_ID", r"(?:[a-fA-F0-9]+)"),
        ("VOLUME_NAME", r"(?:[a-zA-Z0-9][a-zA-Z0-9_.-]+)"),
        ("VOLUME_ID_OR_NAME", r"(?:%VOLUME_ID%|%VOLUME_NAME%)"),
        ("NETWORK_ID", r"(?:[a-fA-F0-9]+)"),
        ("NETWORK_NAME", r"(?:[^/]+)"),
        ("NETWORK_ID_OR_NAME", r"(?:%NETWORK_ID%|%NETWORK_NAME%)"),
        ("PLUGIN_ID", r"(?:[a-fA-F0-9]+)"),
        ("PLUGIN_NAME", r"%IMAGE_NAME%"),
        ("PLUGIN_ID_OR_NAME", r"(?:%PLUGIN_ID%|%PLUGIN_NAME%)"),
        ("API_PREFIX", r"(?:/v[0-9]+(?:\.[0-9]+)*)?"),
        ("API_PREFIX_AUTH", r"%API_PREFIX%/auth"),
        ("API_PREFIX_BUILD", r"%API_PREFIX%/build"),
        ("API_PREFIX_COMMIT", r"%API_PREFIX%/commit"),
        ("API_PREFIX_CONFIGS", r"%API_PREFIX%/configs"),
        ("API_PREFIX_CONTAINERS", r"%API_PREFIX%/containers"),
        ("API_PREFIX_DISTRIBUTION", r"%API_PREFIX%/distribution"),
        ("API_PREFIX_EVENTS", r"%API_PREFIX%/events"),
        ("API_PREFIX_EXEC", r"%API_PREFIX%/exec"),
        ("API_PREFIX_GRPC", r"%API_PREFIX%/grpc"),
        ("API_PREFIX_IMAGES", r"%API_PREFIX%/images"),
        ("API_PREFIX_INFO", r"%API_PREFIX%/info"),
        ("API_PREFIX_NETWORKS", r"%API_PREFIX%/networks"),
        ("API_PREFIX_NODES", r"%API_PREFIX%/nodes"),
        ("API_PREFIX_PING", r"%API_PREFIX%/_ping"),
        ("API_PREFIX_PLUGINS", r"%API_PREFIX%/plugins"),
        ("API_PREFIX_SECRETS", r"%API_PREFIX%/secrets"),
        ("API_PREFIX_SERVICES", r"%API_PREFIX%/services"),
        ("API_PREFIX_SESSION", r"%API_PREFIX%/session"),
        ("API_PREFIX_SWARM", r"%API_PREFIX%/swarm"),
        ("API_PREFIX_SYSTEM", r"%API_PREFIX%/system"),
        ("API_PREFIX_TASKS", r"%API_PREFIX%/tasks"),
        ("API_PREFIX_VERSION", r"%API_PREFIX%/version"),
        ("API_PREFIX_VOLUMES", r"%API_PREFIX%/volumes"),
    ]
}

/// Expands every entry in the variable table against every other entry
/// until a full pass changes nothing. The table is small and acyclic, so a
/// bounded number of passes (one per entry) is always enough to reach the
/// fixpoint.
fn build_variable_table() -> std::collections::HashMap<&'static str, String> {
    let raw = raw_variable_table();
    let mut table: std::collections::HashMap<&'static str, String> =
        raw.iter().map(|(k, v)| (*k, v.to_string())).collect();

    for _ in 0..raw.len() {
        let mut changed = false;
        let snapshot = table.clone();
        for (name, value) in snapshot.iter() {
            let mut expanded = table[name].clone();
            for (k, v) in &snapshot {
                let needle = format!("%{k}%");
                if expanded.contains(&needle) {
                    expanded = expanded.replace(&needle, v);
                    changed = true;
                }
            }
            if &expanded != value {
                table.insert(name, expanded);
            }
        }
        if !changed {
            break;
        }
    }

    debug_assert!(
        table.values().all(|v| !v.contains('%')),
        "variable table did not reach a fixpoint free of %NAME% placeholders"
    );

    table
}

/// Expands `%NAME%` references in `frag` against the variable table,
/// recursively, to a fixpoint. An unresolved reference after expansion is a
/// compile error.
fn expand(frag: &str) -> Result<String, RuleError> {
    let mut current = frag.to_string();
    loop {
        let mut next = current.clone();
        let mut any = false;
        for (name, value) in VARIABLES.iter() {
            let needle = format!("%{name}%");
            if next.contains(&needle) {
                next = next.replace(&needle, value);
                any = true;
            }
        }
        if !any {
            break;
        }
        current = next;
    }

    if let Some(start) = current.find('%') {
        let rest = &current[start + 1..];
        let name = rest.split('%').next().unwrap_or(rest);
        return Err(RuleError::UndefinedVariable {
            name: name.to_string(),
        });
    }

    Ok(current)
}

/// Compiles every non-comment, non-blank line of `src` into a [`Rule`].
pub fn build_rules(src: &str) -> Result<Vec<Rule>, RuleError> {
    let mut rules = Vec::new();

    for line in NEWLINE.split(src) {
        if COMMENT_LINE.is_match(line) {
            continue;
        }

        let caps = RULE_LINE.captures(line).ok_or_else(|| RuleError::Syntax {
            line: line.to_string(),
        })?;
        let methods_frag = &caps[1];
        let pattern_frag = &caps[2];

        let methods: BTreeSet<String> = methods_frag.split(',').map(str::to_string).collect();

        let expanded = expand(pattern_frag)?;
        let anchored = format!("^{expanded}$");
        let pattern = Regex::new(&anchored).map_err(|source| RuleError::Pattern {
            rule: line.to_string(),
            source,
        })?;

        let rule = Rule { methods, pattern };
        tracing::debug!(%rule, "loaded rule");
        rules.push(rule);
    }

    Ok(rules)
}

/// Loads and compiles rules from a file, one rule DSL line at a time. The
/// path must resolve to a regular file (symlinks to one are fine).
pub fn build_rules_from_path(path: &Path) -> Result<Vec<Rule>, RuleError> {
    let go = || -> Result<Vec<Rule>, RuleError> {
        let file = File::open(path)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(RuleError::NotARegularFile(path.to_path_buf()));
        }

        let mut rules = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            rules.extend(build_rules(&line)?);
        }
        Ok(rules)
    };

    go().map_err(|err| match err {
        RuleError::NotARegularFile(p) => RuleError::NotARegularFile(p),
        other => RuleError::File {
            path: path.to_path_buf(),
            source: Box::new(other),
        },
    })
}

/// Builds the full startup rule set: built-ins (unless disabled), then
/// inline rule strings in order, then rule files in order.
pub fn build_rule_set(
    no_default_rules: bool,
    inline: &[String],
    files: &[PathBuf],
) -> Result<Vec<Rule>, RuleError> {
    let mut rules = Vec::new();

    if !no_default_rules {
        rules.extend(build_rules(&RAW_DEFAULT_RULES.join("\n"))?);
    }
    for block in inline {
        rules.extend(build_rules(block)?);
    }
    for path in files {
        rules.extend(build_rules_from_path(path)?);
    }

    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_table_has_no_leftover_placeholders() {
        for (name, value) in VARIABLES.iter() {
            assert!(
                !value.contains('%'),
                "variable {name} still contains an unexpanded placeholder: {value}"
            );
        }
    }

    #[test]
    fn builds_default_rules() {
        let rules = build_rules(&RAW_DEFAULT_RULES.join("\n")).unwrap();
        assert_eq!(rules.len(), 3);
        assert!(rules[0].methods.contains("GET"));
        assert!(rules[0].methods.contains("HEAD"));
        assert!(rules[0].pattern.is_match("/_ping"));
        assert!(rules[0].pattern.is_match("/v1.41/_ping"));
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let rules = build_rules("\n! a comment\n   ! indented comment\nGET /foo\n").unwrap();
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn rejects_malformed_line() {
        let err = build_rules("not a valid rule line because no methods").unwrap_err();
        assert!(matches!(err, RuleError::Syntax { .. }));
    }

    #[test]
    fn rejects_undefined_variable() {
        let err = build_rules("GET %NOT_A_REAL_VARIABLE%").unwrap_err();
        match err {
            RuleError::UndefinedVariable { name } => assert_eq!(name, "NOT_A_REAL_VARIABLE"),
            other => panic!("expected undefined variable error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_invalid_pattern() {
        let err = build_rules("GET ([unterminated").unwrap_err();
        assert!(matches!(err, RuleError::Pattern { .. }));
    }

    #[test]
    fn dedupes_and_sorts_methods_in_display() {
        let rules = build_rules("HEAD,GET,HEAD /x").unwrap();
        assert_eq!(rules[0].to_string(), "GET,HEAD ^/x$");
    }

    #[test]
    fn file_loader_rejects_directories() {
        let err = build_rules_from_path(Path::new(".")).unwrap_err();
        assert!(matches!(err, RuleError::NotARegularFile(_)));
    }

    #[test]
    fn anchor_integrity() {
        let rules = build_rules(r"POST ~foo\+bar").unwrap();
        assert!(!rules[0].pattern.is_match("x~foo+bar"));
        assert!(!rules[0].pattern.is_match("~foo+barx"));
        assert!(rules[0].pattern.is_match("~foo+bar"));
    }
}
