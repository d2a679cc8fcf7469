//! Command Allow-list
//!
//! The only gate between untrusted operator input and process creation.
//! Commands are matched against a fixed set of read-only diagnostics and
//! every argument against a conservative character class, so nothing a
//! shell would interpret (`;`, `|`, `&`, `` ` ``, `$`, redirections, ...)
//! ever reaches `exec`. Commands are spawned directly, never via a shell.

use super::error::ValidationError;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;

/// Maximum length of a single argument, in bytes
pub const MAX_ARG_LEN: usize = 100;

/// Read-only diagnostic commands the console may run
pub const DEFAULT_COMMANDS: &[&str] = &[
    "uptime", "top", "df", "free", "ps", "whoami", "ls", "tree", "pwd", "cat", "echo", "file",
    "stat", "date", "hostname", "uname", "ifconfig", "ping", "lscpu", "lsmem", "lsblk", "clear",
];

lazy_static! {
    // ASCII word characters, `-`, `/`, `.`, `:`, CJK ideographs, `#` and
    // space. `\w` would admit every Unicode letter, so it is spelled out.
    static ref SAFE_ARG_PATTERN: Regex =
        Regex::new(r"^[A-Za-z0-9_\-/.:\p{Han}# ]+$").expect("argument pattern is valid");
}

/// A command that passed the allow-list, ready to spawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCommand {
    name: String,
    args: Vec<String>,
}

impl ValidatedCommand {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Bypass the allow-list. Only for exercising the runner in tests.
    #[cfg(test)]
    pub(crate) fn unchecked(name: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl std::fmt::Display for ValidatedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Static allow-list plus argument sanitizer
#[derive(Debug, Clone)]
pub struct CommandAllowlist {
    commands: BTreeSet<String>,
}

impl Default for CommandAllowlist {
    fn default() -> Self {
        Self::with_commands(DEFAULT_COMMANDS.iter().copied())
    }
}

impl CommandAllowlist {
    /// Build an allow-list from an explicit set of command names
    pub fn with_commands<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
        }
    }

    /// Validate a command name and its raw arguments.
    ///
    /// Arguments are trimmed and empty ones dropped. Any argument over
    /// [`MAX_ARG_LEN`] bytes or outside the safe character class rejects the
    /// whole request.
    ///
    /// # Example
    ///
    /// ```
    /// use hostconsole::terminal::CommandAllowlist;
    ///
    /// let allowlist = CommandAllowlist::default();
    /// assert!(allowlist.validate("ls", &["-la".to_string()]).is_ok());
    /// assert!(allowlist.validate("rm", &["-rf".to_string()]).is_err());
    /// ```
    pub fn validate(&self, name: &str, args: &[String]) -> Result<ValidatedCommand, ValidationError> {
        let name = name.trim();
        if !self.is_allowed(name) {
            return Err(ValidationError::NotPermitted(name.to_string()));
        }

        let mut accepted = Vec::with_capacity(args.len());
        for raw in args {
            let arg = raw.trim();
            if arg.len() > MAX_ARG_LEN {
                return Err(ValidationError::ArgumentTooLong(arg.to_string()));
            }
            if arg.is_empty() {
                continue;
            }
            if !SAFE_ARG_PATTERN.is_match(arg) {
                return Err(ValidationError::ForbiddenCharacters(arg.to_string()));
            }
            accepted.push(arg.to_string());
        }

        Ok(ValidatedCommand {
            name: name.to_string(),
            args: accepted,
        })
    }

    /// Check if a command is on the allow-list
    pub fn is_allowed(&self, name: &str) -> bool {
        self.commands.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_commands() {
        let allowlist = CommandAllowlist::default();
        for name in DEFAULT_COMMANDS {
            assert!(allowlist.is_allowed(name), "{} should be allowed", name);
        }
        for name in ["rm", "bash", "sh", "sudo", "/bin/ls", "LS", ""] {
            assert!(!allowlist.is_allowed(name), "{} should be rejected", name);
        }
    }

    #[test]
    fn test_validate_accepts_listing() {
        let allowlist = CommandAllowlist::default();
        let cmd = allowlist.validate("ls", &args(&["-la", "/var/log"])).unwrap();
        assert_eq!(cmd.name(), "ls");
        assert_eq!(cmd.args(), &["-la".to_string(), "/var/log".to_string()]);
        assert_eq!(cmd.to_string(), "ls -la /var/log");
    }

    #[test]
    fn test_validate_rejects_unknown_command() {
        let allowlist = CommandAllowlist::default();
        let err = allowlist.validate("rm", &args(&["-rf", "/"])).unwrap_err();
        assert_eq!(err, ValidationError::NotPermitted("rm".to_string()));
        assert!(err.to_string().contains("not permitted"));
    }

    #[test]
    fn test_validate_trims_command_name() {
        let allowlist = CommandAllowlist::default();
        assert_eq!(allowlist.validate("  uptime ", &[]).unwrap().name(), "uptime");
    }

    #[test]
    fn test_validate_rejects_injection() {
        let allowlist = CommandAllowlist::default();
        let err = allowlist
            .validate("ping", &args(&["; cat /etc/passwd"]))
            .unwrap_err();
        assert!(matches!(err, ValidationError::ForbiddenCharacters(_)));
    }

    #[test]
    fn test_validate_rejects_shell_metacharacters() {
        let allowlist = CommandAllowlist::default();
        for bad in [
            "a;b", "a|b", "a&b", "`id`", "$HOME", "a>b", "a<b", "(x)", "a\nb", "'q'", "\"q\"",
            "a*", "~root", "a\\b",
        ] {
            let result = allowlist.validate("echo", &args(&[bad]));
            assert!(result.is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_validate_accepts_safe_punctuation() {
        let allowlist = CommandAllowlist::default();
        for good in [
            "-h",
            "--human-readable",
            "/etc/hostname",
            "file_name.txt",
            "127.0.0.1",
            "host:80",
            "#1",
            "hello world",
            "日志",
        ] {
            assert!(
                allowlist.validate("echo", &args(&[good])).is_ok(),
                "{:?} should be accepted",
                good
            );
        }
    }

    #[test]
    fn test_validate_rejects_non_ascii_letters() {
        let allowlist = CommandAllowlist::default();
        for bad in ["привет", "café", "naïve", "ｌｓ", "١٢٣"] {
            let err = allowlist.validate("echo", &args(&[bad])).unwrap_err();
            assert!(
                matches!(err, ValidationError::ForbiddenCharacters(_)),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_validate_drops_empty_and_trims() {
        let allowlist = CommandAllowlist::default();
        let cmd = allowlist
            .validate("df", &args(&["", "  ", " -h "]))
            .unwrap();
        assert_eq!(cmd.args(), &["-h".to_string()]);
    }

    #[test]
    fn test_validate_length_cap() {
        let allowlist = CommandAllowlist::default();
        let at_cap = "a".repeat(MAX_ARG_LEN);
        assert!(allowlist.validate("echo", &[at_cap]).is_ok());

        let over_cap = "a".repeat(MAX_ARG_LEN + 1);
        let err = allowlist.validate("echo", &[over_cap]).unwrap_err();
        assert!(matches!(err, ValidationError::ArgumentTooLong(_)));
    }

    #[test]
    fn test_length_cap_applies_after_trim() {
        let allowlist = CommandAllowlist::default();
        let padded = format!("   {}   ", "a".repeat(MAX_ARG_LEN));
        assert!(allowlist.validate("echo", &[padded]).is_ok());
    }

    #[test]
    fn test_custom_commands() {
        let allowlist = CommandAllowlist::with_commands(["echo"]);
        assert!(allowlist.validate("echo", &[]).is_ok());
        assert!(allowlist.validate("ls", &[]).is_err());
    }

    proptest! {
        #[test]
        fn prop_metacharacters_always_rejected(
            prefix in "[a-z0-9]{1,10}",
            meta in prop::sample::select(vec![';', '|', '&', '`', '$', '<', '>', '(', ')', '\'', '"', '\n']),
            suffix in "[a-z0-9]{1,10}",
        ) {
            let allowlist = CommandAllowlist::default();
            let arg = format!("{}{}{}", prefix, meta, suffix);
            prop_assert!(allowlist.validate("echo", &[arg]).is_err());
        }

        #[test]
        fn prop_plain_tokens_accepted(tokens in prop::collection::vec("[a-zA-Z0-9_./-]{1,20}", 0..5)) {
            let allowlist = CommandAllowlist::default();
            let cmd = allowlist.validate("ls", &tokens).unwrap();
            prop_assert_eq!(cmd.args().len(), tokens.len());
        }
    }
}
