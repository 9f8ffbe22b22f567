//! Engine feature negotiation.

use ahkdbg_config::NormalizedDebugConfig;
use ahkdbg_dbgp::{Command, DbgpError, Session};
use ahkdbg_scanner::EngineVersion;

use crate::error::AdapterError;

/// What the connected engine told us about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineFeatures {
    /// The engine accepts `break` while `run` is in flight.
    pub supports_async: bool,
    /// e.g. `2.0.10`.
    pub language_version: Option<String>,
    /// Breakpoint types the engine accepts (`line`, `conditional`, ...).
    pub breakpoint_types: Vec<String>,
}

impl EngineFeatures {
    /// Query the features the runtime depends on.
    ///
    /// A feature the engine does not know is treated as unsupported.
    pub async fn query(session: &Session) -> Result<Self, AdapterError> {
        let supports_async = feature_get(session, "supports_async")
            .await?
            .is_some_and(|v| v.trim() == "1");
        let language_version = feature_get(session, "language_version").await?;
        let breakpoint_types = feature_get(session, "breakpoint_types")
            .await?
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        let features = Self {
            supports_async,
            language_version,
            breakpoint_types,
        };
        tracing::debug!("engine features: {:?}", features);
        Ok(features)
    }

    /// Whether `kind` may be used with `breakpoint_set -t`.
    ///
    /// Engines that do not list their types are assumed to take anything.
    pub fn supports_breakpoint_type(&self, kind: &str) -> bool {
        self.breakpoint_types.is_empty() || self.breakpoint_types.iter().any(|t| t == kind)
    }

    /// Engine major version from `language_version`, if it reported one.
    pub fn engine_version(&self) -> Option<EngineVersion> {
        let version = self.language_version.as_deref()?.trim();
        let major: u8 = version
            .trim_start_matches(['v', 'V'])
            .split('.')
            .next()?
            .parse()
            .ok()?;
        Some(EngineVersion::from_major(major))
    }
}

/// The `feature_set` commands derived from the configuration.
pub fn feature_set_commands(config: &NormalizedDebugConfig) -> Vec<Command> {
    [
        ("max_children", config.max_children),
        ("max_depth", config.max_depth),
        ("max_data", config.max_data),
    ]
    .into_iter()
    .map(|(name, value)| Command::new("feature_set").arg('n', name).arg('v', value))
    .collect()
}

async fn feature_get(session: &Session, name: &str) -> Result<Option<String>, AdapterError> {
    match session
        .send_command(Command::new("feature_get").arg('n', name))
        .await
    {
        Ok(response) => Ok(response.feature_value()),
        Err(DbgpError::Engine(err)) => {
            tracing::debug!("feature_get {} failed: {}", name, err);
            Ok(None)
        }
        Err(other) => Err(other.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEngine;

    #[test]
    fn engine_version_from_language_version() {
        let mut features = EngineFeatures::default();
        assert_eq!(features.engine_version(), None);
        features.language_version = Some("2.0.10".into());
        assert_eq!(features.engine_version(), Some(EngineVersion::V2));
        features.language_version = Some("v1.1.37.02".into());
        assert_eq!(features.engine_version(), Some(EngineVersion::V1));
        features.language_version = Some("unknown".into());
        assert_eq!(features.engine_version(), None);
    }

    #[test]
    fn unlisted_breakpoint_types_are_allowed() {
        let mut features = EngineFeatures::default();
        assert!(features.supports_breakpoint_type("conditional"));
        features.breakpoint_types = vec!["line".into(), "exception".into()];
        assert!(features.supports_breakpoint_type("exception"));
        assert!(!features.supports_breakpoint_type("conditional"));
    }

    #[test]
    fn feature_set_commands_follow_config() {
        let mut config = NormalizedDebugConfig::new("main.ahk");
        config.max_depth = 2;
        let commands = feature_set_commands(&config);
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[1].get('n'), Some("max_depth"));
        assert_eq!(commands[1].get('v'), Some("2"));
        assert_eq!(commands[0].get('v'), Some("10000"));
    }

    #[tokio::test]
    async fn query_reads_each_feature() {
        let (session, _events, mut engine) = FakeEngine::pair();
        let engine_task = tokio::spawn(async move {
            let (tid, cmd) = engine.next_command().await.unwrap();
            assert_eq!(cmd.get('n'), Some("supports_async"));
            engine
                .feature(tid, "supports_async", Some("1"))
                .await;
            let (tid, _) = engine.next_command().await.unwrap();
            engine.feature(tid, "language_version", Some("2.0.10")).await;
            let (tid, _) = engine.next_command().await.unwrap();
            engine.error(tid, "feature_get", 3, "invalid option").await;
        });
        let features = EngineFeatures::query(&session).await.unwrap();
        engine_task.await.unwrap();
        assert!(features.supports_async);
        assert_eq!(features.language_version.as_deref(), Some("2.0.10"));
        assert!(features.breakpoint_types.is_empty());
    }

    #[tokio::test]
    async fn unsupported_feature_is_none() {
        let (session, _events, mut engine) = FakeEngine::pair();
        let engine_task = tokio::spawn(async move {
            for _ in 0..3 {
                let (tid, cmd) = engine.next_command().await.unwrap();
                let name = cmd.get('n').unwrap_or_default().to_string();
                engine.feature(tid, &name, None).await;
            }
        });
        let features = EngineFeatures::query(&session).await.unwrap();
        engine_task.await.unwrap();
        assert_eq!(features, EngineFeatures::default());
    }
}
