//! Permission decisions for tool invocations.
//!
//! Combines the dangerous-command filter, the user's stored allow/deny
//! rules, and the user's permission tier into a single decision. The
//! evaluation order is fixed: a dangerous-command match blocks regardless
//! of tier, stored denials block next, and only then does the tier decide
//! between auto-approval and a pending approval.

use std::path::Path;
use std::sync::{Arc, RwLock};

use globset::Glob;
use regex::Regex;
use tracing::debug;

use crate::security::DangerousCommandFilter;
use crate::types::{ApprovalRequest, ApprovalResponse, PermissionTier, RiskLevel};

use super::store::ApprovalStore;

/// Characters whose presence marks a stored pattern as a regular expression.
const REGEX_MARKERS: &[char] = &['^', '$', '(', ')', '[', ']', '{', '}', '+', '?', '\\'];

/// Reason attached to dangerous-command blocks.
pub const DANGEROUS_BLOCK_REASON: &str = "command matches dangerous pattern";

/// Outcome class of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    /// Run without asking.
    Auto,
    /// Open an approval request and wait for the user.
    NeedsApproval,
    /// Never run; `block_reason` explains why.
    Blocked,
}

/// Full result of a permission check.
#[derive(Debug, Clone)]
pub struct PermissionCheck {
    pub decision: PermissionDecision,
    /// Present when `decision` is [`PermissionDecision::Blocked`].
    pub block_reason: Option<String>,
    /// Risk carried through from the caller's assessment.
    pub risk: RiskLevel,
}

impl PermissionCheck {
    fn auto(risk: RiskLevel) -> Self {
        Self {
            decision: PermissionDecision::Auto,
            block_reason: None,
            risk,
        }
    }

    fn needs_approval(risk: RiskLevel) -> Self {
        Self {
            decision: PermissionDecision::NeedsApproval,
            block_reason: None,
            risk,
        }
    }

    fn blocked(reason: impl Into<String>, risk: RiskLevel) -> Self {
        Self {
            decision: PermissionDecision::Blocked,
            block_reason: Some(reason.into()),
            risk,
        }
    }
}

/// Tier- and rule-based permission service.
pub struct PermissionService {
    filter: RwLock<DangerousCommandFilter>,
    store: Arc<ApprovalStore>,
}

impl PermissionService {
    /// Build the service over a rule store, with the built-in block-list.
    pub fn new(store: Arc<ApprovalStore>) -> Self {
        Self {
            filter: RwLock::new(DangerousCommandFilter::new()),
            store,
        }
    }

    /// Build the service with a caller-provided filter (used by tests to
    /// start from an empty block-list).
    pub fn with_filter(store: Arc<ApprovalStore>, filter: DangerousCommandFilter) -> Self {
        Self {
            filter: RwLock::new(filter),
            store,
        }
    }

    /// Extend the dangerous-command block-list at runtime.
    pub fn add_dangerous_pattern(&self, pattern: &str) {
        if let Ok(mut filter) = self.filter.write() {
            filter.add(pattern);
        }
    }

    /// Decide what happens to one tool invocation.
    ///
    /// Evaluation order, first match wins:
    /// 1. dangerous-command filter ⇒ blocked
    /// 2. stored denied patterns / denied directories ⇒ blocked
    /// 3. tier `unrestricted` ⇒ auto
    /// 4. tier `restricted` ⇒ needs approval
    /// 5. tier `some`: always-allow, allowed pattern, allowed directory, or
    ///    low risk ⇒ auto; otherwise needs approval
    pub fn check(
        &self,
        user_id: &str,
        tier: PermissionTier,
        tool: &str,
        command: &str,
        working_dir: Option<&Path>,
        risk: RiskLevel,
    ) -> PermissionCheck {
        if let Ok(filter) = self.filter.read() {
            if filter.is_dangerous(command) {
                debug!(user_id, tool, "dangerous command blocked");
                return PermissionCheck::blocked(DANGEROUS_BLOCK_REASON, risk);
            }
        }

        let rules = self.store.tool_rules(user_id, tool).unwrap_or_default();

        if let Some(pattern) = rules
            .denied_patterns
            .iter()
            .find(|p| matches_pattern(p, command))
        {
            return PermissionCheck::blocked(
                format!("command matches denied pattern '{pattern}'"),
                risk,
            );
        }

        if let Some(dir) = working_dir {
            if let Some(denied) = rules
                .denied_directories
                .iter()
                .find(|d| matches_directory(d, dir))
            {
                return PermissionCheck::blocked(
                    format!("working directory is denied: {denied}"),
                    risk,
                );
            }
        }

        match tier {
            PermissionTier::Unrestricted => PermissionCheck::auto(risk),
            PermissionTier::Restricted => PermissionCheck::needs_approval(risk),
            PermissionTier::Some => {
                if rules.always_allow {
                    return PermissionCheck::auto(risk);
                }
                if rules
                    .allowed_patterns
                    .iter()
                    .any(|p| matches_pattern(p, command))
                {
                    return PermissionCheck::auto(risk);
                }
                if let Some(dir) = working_dir {
                    if rules
                        .allowed_directories
                        .iter()
                        .any(|d| matches_directory(d, dir))
                    {
                        return PermissionCheck::auto(risk);
                    }
                }
                if risk == RiskLevel::Low {
                    return PermissionCheck::auto(risk);
                }
                PermissionCheck::needs_approval(risk)
            }
        }
    }

    /// Merge the preferences carried on an approval response into the
    /// user's stored rules and persist them.
    ///
    /// # Errors
    ///
    /// Returns the store error when persistence fails.
    pub fn record_preferences(
        &self,
        req: &ApprovalRequest,
        resp: &ApprovalResponse,
    ) -> Result<(), super::store::StoreError> {
        if !resp.always_allow
            && resp.allow_dir.is_none()
            && resp.allow_pattern.is_none()
            && resp.deny_pattern.is_none()
        {
            return Ok(());
        }

        self.store.update(&req.user_id, &req.tool, |rules| {
            if resp.always_allow {
                rules.always_allow = true;
            }
            if let Some(dir) = &resp.allow_dir {
                if !rules.allowed_directories.contains(dir) {
                    rules.allowed_directories.push(dir.clone());
                }
            }
            if let Some(pattern) = &resp.allow_pattern {
                if !rules.allowed_patterns.contains(pattern) {
                    rules.allowed_patterns.push(pattern.clone());
                }
            }
            if let Some(pattern) = &resp.deny_pattern {
                if !rules.denied_patterns.contains(pattern) {
                    rules.denied_patterns.push(pattern.clone());
                }
            }
        })
    }
}

/// Match a stored pattern against a command.
///
/// Tried in order: glob, then regex (only when the pattern contains a
/// regex marker character), then trailing-`" *"` prefix (`"git *"` matches
/// `git status` as well as bare `git`).
pub fn matches_pattern(pattern: &str, command: &str) -> bool {
    if let Ok(glob) = Glob::new(pattern) {
        if glob.compile_matcher().is_match(command) {
            return true;
        }
    }

    if pattern.contains(REGEX_MARKERS) {
        if let Ok(regex) = Regex::new(pattern) {
            if regex.is_match(command) {
                return true;
            }
        }
    }

    if let Some(prefix) = pattern.strip_suffix(" *") {
        return command == prefix
            || command
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with(' '));
    }

    false
}

/// Match a stored directory rule against a working directory.
///
/// Absolute-path prefix match with a path-separator boundary; never a
/// substring match (`/home/user` does not cover `/home/user2`).
pub fn matches_directory(rule: &str, dir: &Path) -> bool {
    let rule = rule.trim_end_matches('/');
    if rule.is_empty() {
        return false;
    }
    let dir_str = dir.to_string_lossy();
    dir_str == rule
        || dir_str
            .strip_prefix(rule)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn service() -> (tempfile::TempDir, PermissionService) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store =
            Arc::new(ApprovalStore::open(dir.path().join("approvals.yaml")).expect("open store"));
        (dir, PermissionService::new(store))
    }

    // ── Pattern matching ──

    #[test]
    fn glob_pattern_matches() {
        assert!(matches_pattern("git *", "git status"));
        assert!(matches_pattern("ls*", "ls -la"));
        assert!(!matches_pattern("git *", "cargo build"));
    }

    #[test]
    fn regex_pattern_matches() {
        assert!(matches_pattern(r"^cargo (build|test)$", "cargo test"));
        assert!(!matches_pattern(r"^cargo (build|test)$", "cargo publish"));
    }

    #[test]
    fn trailing_star_prefix_matches() {
        assert!(matches_pattern("git *", "git status"));
        assert!(matches_pattern("git *", "git"));
        // No separator boundary violation: "gitk" is not "git …".
        assert!(!matches_pattern("git *", "gitk"));
    }

    // ── Directory matching ──

    #[test]
    fn directory_prefix_with_boundary() {
        assert!(matches_directory("/home/u1", Path::new("/home/u1")));
        assert!(matches_directory(
            "/home/u1",
            Path::new("/home/u1/projects")
        ));
        assert!(!matches_directory("/home/u1", Path::new("/home/u12")));
        assert!(!matches_directory("/home/u1", Path::new("/var/home/u1")));
    }

    // ── Tier evaluation ──

    #[test]
    fn dangerous_command_blocked_for_all_tiers() {
        let (_dir, svc) = service();
        for tier in [
            PermissionTier::Unrestricted,
            PermissionTier::Some,
            PermissionTier::Restricted,
        ] {
            let check = svc.check("u1", tier, "shell", "rm -rf /home", None, RiskLevel::High);
            assert_eq!(check.decision, PermissionDecision::Blocked, "tier {tier}");
            assert_eq!(
                check.block_reason.as_deref(),
                Some(DANGEROUS_BLOCK_REASON),
                "tier {tier}"
            );
        }
    }

    #[test]
    fn unrestricted_auto_approves() {
        let (_dir, svc) = service();
        let check = svc.check(
            "u1",
            PermissionTier::Unrestricted,
            "shell",
            "make deploy",
            None,
            RiskLevel::High,
        );
        assert_eq!(check.decision, PermissionDecision::Auto);
    }

    #[test]
    fn restricted_always_needs_approval() {
        let (_dir, svc) = service();
        let check = svc.check(
            "u1",
            PermissionTier::Restricted,
            "shell",
            "ls",
            None,
            RiskLevel::Low,
        );
        assert_eq!(check.decision, PermissionDecision::NeedsApproval);
    }

    #[test]
    fn some_tier_auto_approves_low_risk() {
        let (_dir, svc) = service();
        let check = svc.check(
            "u1",
            PermissionTier::Some,
            "web",
            "https://api.github.com/users",
            None,
            RiskLevel::Low,
        );
        assert_eq!(check.decision, PermissionDecision::Auto);
    }

    #[test]
    fn some_tier_asks_for_high_risk() {
        let (_dir, svc) = service();
        let check = svc.check(
            "u1",
            PermissionTier::Some,
            "shell",
            "make deploy",
            None,
            RiskLevel::High,
        );
        assert_eq!(check.decision, PermissionDecision::NeedsApproval);
    }

    #[test]
    fn stored_allowed_pattern_wins_over_risk() {
        let (_dir, svc) = service();
        svc.store
            .update("u1", "shell", |r| {
                r.allowed_patterns.push("git *".to_owned());
            })
            .expect("update");

        let check = svc.check(
            "u1",
            PermissionTier::Some,
            "shell",
            "git push origin main",
            None,
            RiskLevel::High,
        );
        assert_eq!(check.decision, PermissionDecision::Auto);
    }

    #[test]
    fn stored_denied_pattern_blocks_even_unrestricted() {
        let (_dir, svc) = service();
        svc.store
            .update("u1", "shell", |r| {
                r.denied_patterns.push("^docker .*".to_owned());
            })
            .expect("update");

        let check = svc.check(
            "u1",
            PermissionTier::Unrestricted,
            "shell",
            "docker ps",
            None,
            RiskLevel::Low,
        );
        assert_eq!(check.decision, PermissionDecision::Blocked);
    }

    #[test]
    fn allowed_directory_auto_approves() {
        let (_dir, svc) = service();
        svc.store
            .update("u1", "shell", |r| {
                r.allowed_directories.push("/home/u1/projects".to_owned());
            })
            .expect("update");

        let check = svc.check(
            "u1",
            PermissionTier::Some,
            "shell",
            "make test",
            Some(&PathBuf::from("/home/u1/projects/pinky")),
            RiskLevel::Medium,
        );
        assert_eq!(check.decision, PermissionDecision::Auto);
    }

    #[test]
    fn denied_directory_blocks() {
        let (_dir, svc) = service();
        svc.store
            .update("u1", "shell", |r| {
                r.denied_directories.push("/etc".to_owned());
            })
            .expect("update");

        let check = svc.check(
            "u1",
            PermissionTier::Unrestricted,
            "shell",
            "ls",
            Some(&PathBuf::from("/etc/ssl")),
            RiskLevel::Low,
        );
        assert_eq!(check.decision, PermissionDecision::Blocked);
    }

    // ── Preference recording ──

    #[test]
    fn record_preferences_merges_and_dedups() {
        let (_dir, svc) = service();
        let req = ApprovalRequest {
            id: "a1".to_owned(),
            user_id: "u1".to_owned(),
            tool: "shell".to_owned(),
            command: "git status".to_owned(),
            args: Default::default(),
            working_dir: None,
            risk: RiskLevel::Medium,
            reason: "tier".to_owned(),
            created_at: chrono::Utc::now(),
        };
        let resp = ApprovalResponse {
            approved: true,
            always_allow: false,
            allow_dir: Some("/home/u1".to_owned()),
            allow_pattern: Some("git *".to_owned()),
            deny_pattern: None,
            modified: None,
        };

        svc.record_preferences(&req, &resp).expect("record");
        svc.record_preferences(&req, &resp).expect("record twice");

        let rules = svc.store.tool_rules("u1", "shell").expect("rules");
        assert_eq!(rules.allowed_directories, vec!["/home/u1".to_owned()]);
        assert_eq!(rules.allowed_patterns, vec!["git *".to_owned()]);
    }

    #[test]
    fn record_then_check_matches_reloaded_decision() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("approvals.yaml");
        let store = Arc::new(ApprovalStore::open(&path).expect("open"));
        let svc = PermissionService::new(store);
        svc.store
            .update("u1", "shell", |r| r.always_allow = true)
            .expect("update");

        let live = svc
            .check(
                "u1",
                PermissionTier::Some,
                "shell",
                "make check",
                None,
                RiskLevel::High,
            )
            .decision;

        let reloaded_store = Arc::new(ApprovalStore::open(&path).expect("reopen"));
        let reloaded = PermissionService::new(reloaded_store)
            .check(
                "u1",
                PermissionTier::Some,
                "shell",
                "make check",
                None,
                RiskLevel::High,
            )
            .decision;

        assert_eq!(live, reloaded);
        assert_eq!(live, PermissionDecision::Auto);
    }
}
