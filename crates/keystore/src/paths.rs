use std::path::PathBuf;

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

/// Expand a leading `~` and `$VAR` / `${VAR}` references.
///
/// Unknown variables are left as-is.
pub fn expand_path(path: &str) -> PathBuf {
    let mut expanded = String::with_capacity(path.len());

    let rest = if path == "~" || path.starts_with("~/") {
        match home_dir() {
            Some(home) => {
                expanded.push_str(&home.to_string_lossy());
                &path[1..]
            }
            None => path,
        }
    } else {
        path
    };

    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            expanded.push(c);
            continue;
        }

        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }
        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphanumeric() || next == '_' {
                name.push(next);
                chars.next();
            } else {
                break;
            }
        }
        if braced && chars.peek() == Some(&'}') {
            chars.next();
        }

        match std::env::var(&name) {
            Ok(value) if !name.is_empty() => expanded.push_str(&value),
            _ => {
                expanded.push('$');
                if braced {
                    expanded.push('{');
                    expanded.push_str(&name);
                    expanded.push('}');
                } else {
                    expanded.push_str(&name);
                }
            }
        }
    }

    PathBuf::from(expanded)
}

/// `~/.mumblechat`
pub fn default_config_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mumblechat")
}

/// `~/.mumblechat/keys/node.key`
pub fn default_key_path() -> PathBuf {
    default_config_dir().join("keys").join("node.key")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        if let Some(home) = home_dir() {
            assert_eq!(expand_path("~/x"), home.join("x"));
            assert_eq!(expand_path("~"), home);
        }
    }

    #[test]
    fn test_expand_env_var() {
        std::env::set_var("MUMBLECHAT_TEST_DIR", "/srv/data");
        assert_eq!(expand_path("$MUMBLECHAT_TEST_DIR/a"), PathBuf::from("/srv/data/a"));
        assert_eq!(expand_path("${MUMBLECHAT_TEST_DIR}/b"), PathBuf::from("/srv/data/b"));
    }

    #[test]
    fn test_unknown_var_left_alone() {
        assert_eq!(
            expand_path("/tmp/$MUMBLECHAT_SURELY_UNSET_VAR"),
            PathBuf::from("/tmp/$MUMBLECHAT_SURELY_UNSET_VAR")
        );
    }

    #[test]
    fn test_plain_path_unchanged() {
        assert_eq!(expand_path("/etc/mumble"), PathBuf::from("/etc/mumble"));
    }

    #[test]
    fn test_default_dirs() {
        assert!(default_config_dir().ends_with(".mumblechat"));
        assert!(default_key_path().ends_with("keys/node.key"));
    }
}
