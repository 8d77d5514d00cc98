//! Block-list of command patterns that are never allowed to run.
//!
//! A match here is a hard block: no permission tier or stored user rule can
//! override it. Patterns are compiled once at construction; a pattern that
//! fails to compile is skipped with a warning so one bad entry can never
//! disable the whole filter.

use regex::Regex;
use tracing::warn;

/// Built-in block-list covering destructive file operations, remote-exec
/// pipes, command substitution, container escapes, kernel module loads,
/// credential reads, history wipes, and netcat exec shells.
const DEFAULT_PATTERNS: &[&str] = &[
    // Destructive file operations
    r"rm\s+(-[rRf]+\s+)*(/|~|\$HOME)(\s|$)",
    r"rm\s+-[rRf]*[rR][rRf]*\s+/\S*",
    r"rm\s+(-[rRf]+\s+)+\*",
    r"shred\s+.*/dev/",
    r"dd\s+.*of=/dev/",
    r"mkfs(\.\w+)?\s",
    r">\s*/dev/sd[a-z]",
    r"chmod\s+(-R\s+)?777\s+/(\s|$)",
    r"chown\s+-R\s+.*\s+/(\s|$)",
    r"mv\s+.*\s+/dev/null",
    // Fork bomb
    r":\(\)\s*\{\s*:\|:\s*&\s*\}\s*;",
    // Remote code execution pipes
    r"curl\s+[^|]*\|\s*(ba|z|da|k)?sh",
    r"wget\s+[^|]*\|\s*(ba|z|da|k)?sh",
    r"curl\s+[^|]*\|\s*python\d?",
    r"wget\s+[^|]*\|\s*python\d?",
    r"fetch\s+[^|]*\|\s*(ba|z|da|k)?sh",
    // Command substitution and dynamic evaluation
    r"`[^`]+`",
    r"\$\([^)]+\)",
    r"\beval\s",
    r"\bexec\s",
    // Container escape
    r"docker\s+run\s+.*--privileged",
    r"docker\s+run\s+.*-v\s+/:/",
    r"docker\s+run\s+.*--pid=host",
    r"\bnsenter\b",
    // Kernel modules
    r"\binsmod\b",
    r"\brmmod\b",
    r"\bmodprobe\b",
    // Credential and secret reads
    r"(cat|less|more|head|tail|cp|scp)\s+.*~/\.ssh/",
    r"(cat|less|more|head|tail|cp|scp)\s+.*/\.ssh/id_",
    r"(cat|less|more|head|tail|cp|scp)\s+.*/etc/shadow",
    r"(cat|less|more|head|tail|cp|scp)\s+.*/etc/passwd",
    r"(cat|less|more|head|tail)\s+.*\.aws/credentials",
    // Shell history wipes
    r"history\s+-c",
    r"(rm|shred|truncate)\s+.*\.(bash|zsh)_history",
    r">\s*~/\.(bash|zsh)_history",
    // Netcat exec shells
    r"nc\s+.*-e\s*/bin/",
    r"ncat\s+.*--exec",
    r"netcat\s+.*-e\s",
    // System state
    r"\b(shutdown|reboot|halt|poweroff)\b",
    r"\binit\s+[06]\b",
    r"sysctl\s+-w",
    r">\s*/proc/sys/",
];

/// Regex block-list for destructive or escalation-prone commands.
///
/// `is_dangerous` is on the hot path of every permission check, so all
/// patterns are compiled at construction time.
#[derive(Debug)]
pub struct DangerousCommandFilter {
    patterns: Vec<Regex>,
}

impl DangerousCommandFilter {
    /// Build the filter from the built-in block-list.
    pub fn new() -> Self {
        let mut filter = Self {
            patterns: Vec::with_capacity(DEFAULT_PATTERNS.len()),
        };
        for pattern in DEFAULT_PATTERNS {
            filter.add(pattern);
        }
        filter
    }

    /// Build an empty filter (no built-ins). Patterns are added with [`add`].
    ///
    /// [`add`]: DangerousCommandFilter::add
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    /// Add a pattern at runtime.
    ///
    /// A pattern that fails to compile is skipped with a warning; evaluation
    /// is never aborted by a malformed entry.
    pub fn add(&mut self, pattern: &str) {
        match Regex::new(pattern) {
            Ok(regex) => self.patterns.push(regex),
            Err(e) => warn!(pattern, error = %e, "skipping malformed dangerous-command pattern"),
        }
    }

    /// Returns `true` when the command matches any block-list entry.
    pub fn is_dangerous(&self, command: &str) -> bool {
        self.patterns.iter().any(|regex| regex.is_match(command))
    }

    /// Number of successfully compiled patterns.
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

impl Default for DangerousCommandFilter {
    fn default() -> Self {
        Self::new()
    }
}
