//! The entrypoint contract of an image.

use serde::{Deserialize, Serialize};

/// What runs when the image is launched.
///
/// With no arguments the default arguments are used; otherwise the supplied
/// arguments are passed through verbatim and the defaults are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrypointContract {
    executable: String,
    #[serde(default)]
    default_args: Vec<String>,
}

impl EntrypointContract {
    /// Creates a contract.
    #[must_use]
    pub fn new(executable: impl Into<String>, default_args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            default_args,
        }
    }

    /// The executable name or absolute path.
    #[must_use]
    pub fn executable(&self) -> &str {
        &self.executable
    }

    /// Arguments used when the launch supplies none.
    #[must_use]
    pub fn default_args(&self) -> &[String] {
        &self.default_args
    }

    /// Resolves the arguments passed to the executable.
    #[must_use]
    pub fn resolve(&self, args: &[String]) -> Vec<String> {
        if args.is_empty() {
            self.default_args.clone()
        } else {
            args.to_vec()
        }
    }

    /// The full command line, executable first.
    #[must_use]
    pub fn command_line(&self, args: &[String]) -> Vec<String> {
        std::iter::once(self.executable.clone())
            .chain(self.resolve(args))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract() -> EntrypointContract {
        EntrypointContract::new("assistant", vec!["--help".into()])
    }

    #[test]
    fn test_no_args_uses_defaults() {
        assert_eq!(contract().resolve(&[]), vec!["--help".to_string()]);
        assert_eq!(contract().command_line(&[]), vec!["assistant", "--help"]);
    }

    #[test]
    fn test_args_pass_through_verbatim() {
        let args = vec!["run".to_string(), "--port".to_string(), "5005".to_string()];
        assert_eq!(contract().resolve(&args), args);

        let unknown = vec!["frobnicate".to_string()];
        assert_eq!(contract().command_line(&unknown), vec!["assistant", "frobnicate"]);
    }

    #[test]
    fn test_empty_defaults() {
        let contract = EntrypointContract::new("/usr/bin/svc", Vec::new());
        assert!(contract.resolve(&[]).is_empty());
    }
}
