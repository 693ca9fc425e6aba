//! CI environment detection
//!
//! Reads well-known environment variables to recover build metadata when the
//! runner executes inside a CI job. Platforms are probed in a fixed order and
//! the first signature that matches wins; values from different platforms are
//! never mixed.

use std::collections::HashMap;

use crate::config::RunConfig;

/// Source of environment variables, abstracted so detection is testable
/// without mutating the process environment.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads from the real process environment.
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Build metadata recovered from a CI environment. Absent fields mean the
/// platform does not expose that signal (or no platform matched).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CiVars {
    pub build: Option<String>,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub pull_request: Option<String>,
    pub repo_slug: Option<String>,
}

/// Returns the value only when set and non-empty. CI systems routinely export
/// empty strings for unset slots, which must read as absent.
fn present(env: &impl EnvSource, key: &str) -> Option<String> {
    env.get(key).filter(|v| !v.is_empty())
}

fn is(env: &impl EnvSource, key: &str, expected: &str) -> bool {
    env.get(key).as_deref() == Some(expected)
}

/// Detect CI variables from the process environment.
pub fn detect() -> CiVars {
    detect_from(&ProcessEnv)
}

/// Detect CI variables from an arbitrary environment source. First matching
/// platform signature wins.
pub fn detect_from(env: &impl EnvSource) -> CiVars {
    // Jenkins
    if present(env, "JENKINS_URL").is_some() || present(env, "JENKINS_HOME").is_some() {
        return CiVars {
            build: present(env, "BUILD_NUMBER"),
            branch: present(env, "ghprbSourceBranch").or_else(|| present(env, "GIT_BRANCH")),
            commit: present(env, "ghprbActualCommit").or_else(|| present(env, "GIT_COMMIT")),
            ..CiVars::default()
        };
    }
    // CircleCI
    if is(env, "CI", "true") && is(env, "CIRCLECI", "true") {
        return CiVars {
            build: present(env, "CIRCLE_BUILD_NUM"),
            branch: present(env, "CIRCLE_BRANCH"),
            commit: present(env, "CIRCLE_SHA1"),
            ..CiVars::default()
        };
    }
    // Travis CI. Pull-request jobs report the merge target in TRAVIS_BRANCH,
    // so prefer the PR source branch/commit when present. When the source and
    // target branch share a name (cross-repo PRs), prefix with the source
    // repo slug to keep the two distinguishable.
    if is(env, "CI", "true") && is(env, "TRAVIS", "true") {
        let base_branch = present(env, "TRAVIS_BRANCH");
        let pr_branch = present(env, "TRAVIS_PULL_REQUEST_BRANCH");
        let slug = present(env, "TRAVIS_PULL_REQUEST_SLUG");
        let branch = match (&pr_branch, &base_branch) {
            (Some(pr), Some(base)) if pr == base => match &slug {
                Some(slug) => Some(format!("{}/{}", slug, pr)),
                None => pr_branch.clone(),
            },
            (Some(_), _) => pr_branch.clone(),
            (None, _) => base_branch.clone(),
        };
        return CiVars {
            build: present(env, "TRAVIS_BUILD_NUMBER"),
            branch,
            commit: present(env, "TRAVIS_PULL_REQUEST_SHA")
                .or_else(|| present(env, "TRAVIS_COMMIT")),
            repo_slug: slug,
            ..CiVars::default()
        };
    }
    // Codeship
    if is(env, "CI", "true") && is(env, "CI_NAME", "codeship") {
        return CiVars {
            build: present(env, "CI_BUILD_NUMBER"),
            branch: present(env, "CI_BRANCH"),
            commit: present(env, "CI_COMMIT_ID"),
            ..CiVars::default()
        };
    }
    // Bitbucket Pipelines
    if present(env, "BITBUCKET_BRANCH").is_some() && present(env, "BITBUCKET_COMMIT").is_some() {
        return CiVars {
            build: present(env, "BITBUCKET_BUILD_NUMBER"),
            branch: present(env, "BITBUCKET_BRANCH"),
            commit: present(env, "BITBUCKET_COMMIT"),
            ..CiVars::default()
        };
    }
    // Drone
    if is(env, "CI", "true") && is(env, "DRONE", "true") {
        return CiVars {
            build: present(env, "DRONE_BUILD_NUMBER"),
            branch: present(env, "DRONE_BRANCH"),
            commit: present(env, "DRONE_COMMIT"),
            pull_request: present(env, "DRONE_PULL_REQUEST"),
            ..CiVars::default()
        };
    }
    // Semaphore
    if is(env, "CI", "true") && is(env, "SEMAPHORE", "true") {
        return CiVars {
            build: present(env, "SEMAPHORE_BUILD_NUMBER"),
            branch: present(env, "BRANCH_NAME"),
            commit: present(env, "REVISION"),
            pull_request: present(env, "PULL_REQUEST_NUMBER"),
            ..CiVars::default()
        };
    }
    // GitLab CI
    if is(env, "CI_SERVER_NAME", "GitLab CI") || is(env, "CI_SERVER_NAME", "GitLab") {
        return CiVars {
            build: present(env, "CI_JOB_ID").or_else(|| present(env, "CI_BUILD_ID")),
            branch: present(env, "CI_COMMIT_REF_NAME"),
            commit: present(env, "CI_COMMIT_SHA"),
            ..CiVars::default()
        };
    }
    // Buildkite
    if is(env, "BUILDKITE", "true") {
        return CiVars {
            build: present(env, "BUILDKITE_BUILD_NUMBER"),
            branch: present(env, "BUILDKITE_BRANCH"),
            commit: present(env, "BUILDKITE_COMMIT"),
            ..CiVars::default()
        };
    }
    // Azure Pipelines. Branch arrives as a full ref; PR id is only exported
    // for pull-request triggered runs.
    if is(env, "TF_BUILD", "True") {
        return CiVars {
            build: present(env, "BUILD_BUILDID"),
            branch: present(env, "BUILD_SOURCEBRANCH")
                .map(|b| b.trim_start_matches("refs/heads/").to_string()),
            commit: present(env, "BUILD_SOURCEVERSION"),
            pull_request: present(env, "SYSTEM_PULLREQUEST_PULLREQUESTID"),
            ..CiVars::default()
        };
    }
    CiVars::default()
}

/// Fill build/branch/commit/pullRequest from CI detection without clobbering
/// values the caller supplied. Empty-string caller values count as absent.
pub fn merge_vars(config: &mut RunConfig, vars: CiVars) {
    fn fill(slot: &mut Option<String>, detected: Option<String>) {
        let empty = slot.as_deref().map(str::is_empty).unwrap_or(true);
        if empty {
            if let Some(value) = detected {
                *slot = Some(value);
            }
        }
    }
    fill(&mut config.build, vars.build);
    fill(&mut config.branch, vars.branch);
    fill(&mut config.commit, vars.commit);
    fill(&mut config.pull_request, vars.pull_request);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::minimal_config;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_no_platform_detected() {
        assert_eq!(detect_from(&env(&[])), CiVars::default());
    }

    #[test]
    fn test_jenkins_basic() {
        let vars = detect_from(&env(&[
            ("JENKINS_URL", "https://jenkins.local/"),
            ("BUILD_NUMBER", "42"),
            ("GIT_BRANCH", "origin/main"),
            ("GIT_COMMIT", "abc123"),
        ]));
        assert_eq!(vars.build.as_deref(), Some("42"));
        assert_eq!(vars.branch.as_deref(), Some("origin/main"));
        assert_eq!(vars.commit.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_jenkins_pull_request_overrides() {
        let vars = detect_from(&env(&[
            ("JENKINS_HOME", "/var/jenkins"),
            ("GIT_BRANCH", "origin/main"),
            ("GIT_COMMIT", "base-sha"),
            ("ghprbSourceBranch", "feature/x"),
            ("ghprbActualCommit", "pr-sha"),
        ]));
        assert_eq!(vars.branch.as_deref(), Some("feature/x"));
        assert_eq!(vars.commit.as_deref(), Some("pr-sha"));
    }

    #[test]
    fn test_circleci() {
        let vars = detect_from(&env(&[
            ("CI", "true"),
            ("CIRCLECI", "true"),
            ("CIRCLE_BUILD_NUM", "7"),
            ("CIRCLE_BRANCH", "main"),
            ("CIRCLE_SHA1", "deadbeef"),
        ]));
        assert_eq!(vars.build.as_deref(), Some("7"));
        assert_eq!(vars.commit.as_deref(), Some("deadbeef"));
    }

    #[test]
    fn test_travis_prefers_pull_request_pair() {
        let vars = detect_from(&env(&[
            ("CI", "true"),
            ("TRAVIS", "true"),
            ("TRAVIS_BUILD_NUMBER", "9"),
            ("TRAVIS_BRANCH", "main"),
            ("TRAVIS_COMMIT", "merge-sha"),
            ("TRAVIS_PULL_REQUEST_BRANCH", "fix/button"),
            ("TRAVIS_PULL_REQUEST_SHA", "head-sha"),
        ]));
        assert_eq!(vars.branch.as_deref(), Some("fix/button"));
        assert_eq!(vars.commit.as_deref(), Some("head-sha"));
    }

    #[test]
    fn test_travis_prefixes_slug_on_branch_collision() {
        let vars = detect_from(&env(&[
            ("CI", "true"),
            ("TRAVIS", "true"),
            ("TRAVIS_BRANCH", "main"),
            ("TRAVIS_PULL_REQUEST_BRANCH", "main"),
            ("TRAVIS_PULL_REQUEST_SLUG", "fork/storefront"),
            ("TRAVIS_COMMIT", "sha"),
        ]));
        assert_eq!(vars.branch.as_deref(), Some("fork/storefront/main"));
        assert_eq!(vars.repo_slug.as_deref(), Some("fork/storefront"));
    }

    #[test]
    fn test_bitbucket_requires_both_signals() {
        let partial = detect_from(&env(&[("BITBUCKET_BRANCH", "main")]));
        assert_eq!(partial, CiVars::default());

        let vars = detect_from(&env(&[
            ("BITBUCKET_BRANCH", "main"),
            ("BITBUCKET_COMMIT", "sha"),
            ("BITBUCKET_BUILD_NUMBER", "3"),
        ]));
        assert_eq!(vars.build.as_deref(), Some("3"));
    }

    #[test]
    fn test_azure_strips_ref_prefix() {
        let vars = detect_from(&env(&[
            ("TF_BUILD", "True"),
            ("BUILD_BUILDID", "55"),
            ("BUILD_SOURCEBRANCH", "refs/heads/release/1.2"),
            ("BUILD_SOURCEVERSION", "sha"),
        ]));
        assert_eq!(vars.branch.as_deref(), Some("release/1.2"));
        assert_eq!(vars.pull_request, None);
    }

    #[test]
    fn test_azure_includes_pull_request_when_present() {
        let vars = detect_from(&env(&[
            ("TF_BUILD", "True"),
            ("BUILD_SOURCEBRANCH", "refs/pull/12/merge"),
            ("SYSTEM_PULLREQUEST_PULLREQUESTID", "12"),
        ]));
        assert_eq!(vars.pull_request.as_deref(), Some("12"));
    }

    #[test]
    fn test_first_match_wins() {
        // Jenkins and CircleCI signatures both present: Jenkins is probed
        // first, so its values win outright.
        let vars = detect_from(&env(&[
            ("JENKINS_URL", "https://jenkins.local/"),
            ("BUILD_NUMBER", "1"),
            ("CI", "true"),
            ("CIRCLECI", "true"),
            ("CIRCLE_BUILD_NUM", "2"),
        ]));
        assert_eq!(vars.build.as_deref(), Some("1"));
    }

    #[test]
    fn test_empty_values_read_as_absent() {
        let vars = detect_from(&env(&[
            ("CI", "true"),
            ("CIRCLECI", "true"),
            ("CIRCLE_BUILD_NUM", ""),
            ("CIRCLE_BRANCH", "main"),
        ]));
        assert_eq!(vars.build, None);
        assert_eq!(vars.branch.as_deref(), Some("main"));
    }

    #[test]
    fn test_merge_preserves_caller_values() {
        let mut config = minimal_config();
        config.branch = Some("override".to_string());
        config.build = Some(String::new());
        merge_vars(
            &mut config,
            CiVars {
                build: Some("10".to_string()),
                branch: Some("detected".to_string()),
                commit: Some("sha".to_string()),
                ..CiVars::default()
            },
        );
        assert_eq!(config.branch.as_deref(), Some("override"));
        assert_eq!(config.build.as_deref(), Some("10"));
        assert_eq!(config.commit.as_deref(), Some("sha"));
    }
}
