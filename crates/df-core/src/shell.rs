//! Helpers for building remote shell command lines

/// Quote a string for a POSIX shell using single quotes
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}

/// Quote only when `value` contains characters the shell would interpret
pub fn word(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_.+:=/~,@%".contains(c));
    if plain {
        value.to_string()
    } else {
        quote(value)
    }
}

/// Join two remote path fragments with exactly one slash
pub fn join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// Parent directory of a remote path, if it has one
pub fn parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("/usr/local/app"), "'/usr/local/app'");
        assert_eq!(quote("it's"), r#"'it'"'"'s'"#);
    }

    #[test]
    fn test_word() {
        assert_eq!(word("oracle-java8-jdk"), "oracle-java8-jdk");
        assert_eq!(word("python3=3.7.3-1"), "python3=3.7.3-1");
        assert_eq!(word("a b"), "'a b'");
        assert_eq!(word("$(reboot)"), "'$(reboot)'");
        assert_eq!(word(""), "''");
    }

    #[test]
    fn test_join_and_parent() {
        assert_eq!(join("/usr/local/app/", "/bin"), "/usr/local/app/bin");
        assert_eq!(parent("/var/lib/devfleet/dependencies"), Some("/var/lib/devfleet"));
        assert_eq!(parent("/etc"), Some("/"));
        assert_eq!(parent("relative"), None);
    }
}
