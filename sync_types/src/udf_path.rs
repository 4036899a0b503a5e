use std::{
    fmt,
    str::FromStr,
};

pub const MAX_IDENTIFIER_LEN: usize = 64;

pub fn check_valid_path_component(s: &str) -> anyhow::Result<()> {
    if s.len() > MAX_IDENTIFIER_LEN {
        anyhow::bail!(
            "Path component is too long ({} > maximum {}).",
            s.len(),
            MAX_IDENTIFIER_LEN
        );
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        anyhow::bail!(
            "Path component {s} can only contain alphanumeric characters, underscores, or periods."
        );
    }
    if !s.chars().any(|c| c.is_ascii_alphanumeric()) {
        anyhow::bail!("Path component {s} must have at least one alphanumeric character.");
    }
    Ok(())
}

/// Canonicalized path to a function in a deployment's module tree.
///
/// Paths are written as `"path/to/module:function"`. The `.js` extension on
/// the module is optional, and a missing function name refers to the module's
/// `default` export.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UdfPath {
    module: String,
    function: String,
}

impl UdfPath {
    /// The module path, without its `.js` extension.
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn function_name(&self) -> &str {
        &self.function
    }
}

impl FromStr for UdfPath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (module, function) = match s.rsplit_once(':') {
            Some((module, function)) => (module, function),
            None => (s, "default"),
        };
        let module = module.strip_suffix(".js").unwrap_or(module);
        anyhow::ensure!(!module.is_empty(), "Module path must be nonempty.");
        for component in module.split('/') {
            check_valid_path_component(component)?;
        }
        check_valid_path_component(function)?;
        Ok(Self {
            module: module.to_owned(),
            function: function.to_owned(),
        })
    }
}

impl fmt::Display for UdfPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.function)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::UdfPath;

    #[test]
    fn test_parse() -> anyhow::Result<()> {
        let path = UdfPath::from_str("messages/send.js:sendAnonymous")?;
        assert_eq!(path.module(), "messages/send");
        assert_eq!(path.function_name(), "sendAnonymous");

        let path = UdfPath::from_str("listMessages")?;
        assert_eq!(path.module(), "listMessages");
        assert_eq!(path.function_name(), "default");
        Ok(())
    }

    #[test]
    fn test_display_roundtrips() -> anyhow::Result<()> {
        for s in ["messages:list", "a/b/c:default", "tasks.js:complete"] {
            let path = UdfPath::from_str(s)?;
            assert_eq!(UdfPath::from_str(&path.to_string())?, path);
        }
        Ok(())
    }

    #[test]
    fn test_invalid_paths() {
        for s in ["", "foo bar:baz", "foo:bar:baz qux", "__:!!"] {
            assert!(UdfPath::from_str(s).is_err(), "{s} should not parse");
        }
    }
}
