//! Credential resolution chain for one user profile: user-specific token
//! file, then environment variable. First non-empty value wins; the source
//! name is logged so operators can diagnose "which file am I reading?"
//! confusion.

use crate::types::UserProfile;

/// Resolves a remote API token for a profile, naming where it came from.
pub trait CredentialSource: Send + Sync {
    /// Resolve a token for `profile`, returning `(source_name, token)`.
    fn resolve(&self, profile: &UserProfile) -> Option<(String, String)>;
}

/// Reference [`CredentialSource`]: a token file under the profile root, then
/// a per-user environment variable, then a generic fallback variable.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileThenEnvCredentialSource;

impl CredentialSource for FileThenEnvCredentialSource {
    fn resolve(&self, profile: &UserProfile) -> Option<(String, String)> {
        let token_file = profile.profile_root.join(".relay-sync-agent").join("token");
        if let Ok(contents) = std::fs::read_to_string(&token_file) {
            let token = contents.trim().to_string();
            if !token.is_empty() {
                return Some((format!("file:{}", token_file.display()), token));
            }
        }

        let per_user_var = format!("RELAY_SYNC_AGENT_TOKEN_{}", sanitize_env_suffix(&profile.sid));
        if let Ok(token) = std::env::var(&per_user_var) {
            if !token.trim().is_empty() {
                return Some((format!("env:{per_user_var}"), token.trim().to_string()));
            }
        }

        if let Ok(token) = std::env::var("RELAY_SYNC_AGENT_TOKEN") {
            if !token.trim().is_empty() {
                return Some(("env:RELAY_SYNC_AGENT_TOKEN".to_string(), token.trim().to_string()));
            }
        }

        None
    }
}

fn sanitize_env_suffix(sid: &str) -> String {
    sid.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn profile_at(root: std::path::PathBuf, sid: &str) -> UserProfile {
        UserProfile {
            sid: sid.to_string(),
            username: sid.to_string(),
            config_path: root.join(".relay-sync-agent").join("config.json"),
            state_path: root.join(".relay-sync-agent").join("state.json"),
            log_dir: root.join(".relay-sync-agent").join("logs"),
            profile_root: root,
        }
    }

    #[test]
    fn token_file_wins_when_present() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".relay-sync-agent")).unwrap();
        std::fs::write(dir.path().join(".relay-sync-agent").join("token"), "  secret-token\n").unwrap();

        let resolver = FileThenEnvCredentialSource;
        let profile = profile_at(dir.path().to_path_buf(), "alice");
        let (source, token) = resolver.resolve(&profile).unwrap();
        assert_eq!(token, "secret-token");
        assert!(source.starts_with("file:"));
    }

    #[test]
    #[serial]
    fn falls_back_to_per_user_env_var() {
        let dir = TempDir::new().unwrap();
        let profile = profile_at(dir.path().to_path_buf(), "bob");
        std::env::set_var("RELAY_SYNC_AGENT_TOKEN_BOB", "env-secret");
        std::env::remove_var("RELAY_SYNC_AGENT_TOKEN");

        let resolver = FileThenEnvCredentialSource;
        let (source, token) = resolver.resolve(&profile).unwrap();
        assert_eq!(token, "env-secret");
        assert!(source.contains("RELAY_SYNC_AGENT_TOKEN_BOB"));

        std::env::remove_var("RELAY_SYNC_AGENT_TOKEN_BOB");
    }

    #[test]
    #[serial]
    fn no_source_returns_none() {
        let dir = TempDir::new().unwrap();
        let profile = profile_at(dir.path().to_path_buf(), "carol");
        std::env::remove_var("RELAY_SYNC_AGENT_TOKEN_CAROL");
        std::env::remove_var("RELAY_SYNC_AGENT_TOKEN");

        let resolver = FileThenEnvCredentialSource;
        assert!(resolver.resolve(&profile).is_none());
    }
}
