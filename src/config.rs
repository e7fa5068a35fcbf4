use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::agent::AgentConfig;
use crate::error::{ConfigError, Result};
use crate::intent::IntentConfig;
use crate::mcp::HealthConfig;
use crate::util::expand_tilde;

pub const DEFAULT_STORE_PATH: &str = "~/.call-copilot/servers.json";
pub const DEFAULT_CONFIG_PATH: &str = "~/.call-copilot/config.yaml";

/// 应用配置（YAML），每个字段都有默认值
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CopilotConfig {
    /// 服务端配置与工具调用日志的 JSON 文件
    pub store_path: PathBuf,
    /// `COPILOT_MODEL_<ID>_*` 环境变量中的模型名
    pub model: Option<String>,
    pub health: HealthConfig,
    pub agent: AgentConfig,
    pub intent: IntentConfig,
}

impl Default for CopilotConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
            model: None,
            health: HealthConfig::default(),
            agent: AgentConfig::default(),
            intent: IntentConfig::default(),
        }
    }
}

impl CopilotConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = expand_tilde(path.as_ref());
        let file = std::fs::File::open(&path)
            .map_err(|_| ConfigError::FileNotFound(path.display().to_string()))?;
        let config: CopilotConfig = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    /// 文件不存在时使用默认配置，存在但解析失败时报错
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let expanded = expand_tilde(path.as_ref());
        if !expanded.exists() {
            tracing::debug!(path = %expanded.display(), "配置文件不存在，使用默认配置");
            return Ok(Self::default());
        }
        Self::load(expanded)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, message: &str| ConfigError::InvalidValue {
            field: field.to_string(),
            message: message.to_string(),
        };
        if self.health.check_interval_ms == 0 {
            return Err(invalid("health.check_interval_ms", "必须大于 0").into());
        }
        if self.health.initial_reconnect_delay_ms > self.health.max_reconnect_delay_ms {
            return Err(invalid(
                "health.initial_reconnect_delay_ms",
                "不能大于 max_reconnect_delay_ms",
            )
            .into());
        }
        if self.agent.max_tool_calls == 0 {
            return Err(invalid("agent.max_tool_calls", "必须大于 0").into());
        }
        if self.agent.preserved_head >= self.agent.max_history {
            return Err(invalid("agent.preserved_head", "必须小于 max_history").into());
        }
        Ok(())
    }

    pub fn store_path(&self) -> PathBuf {
        expand_tilde(&self.store_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CopilotError;
    use std::io::Write;

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "store_path: /tmp/copilot.json\nhealth:\n  max_reconnect_attempts: 3\nagent:\n  max_history: 12\n"
        )
        .unwrap();

        let config = CopilotConfig::load(file.path()).unwrap();
        assert_eq!(config.store_path(), PathBuf::from("/tmp/copilot.json"));
        assert_eq!(config.health.max_reconnect_attempts, 3);
        assert_eq!(config.health.check_interval_ms, 30_000);
        assert_eq!(config.agent.max_history, 12);
        assert_eq!(config.agent.max_tool_calls, 5);
        assert_eq!(config.intent.cooldown_ms, 30_000);
        assert!(config.model.is_none());
    }

    #[test]
    fn test_missing_and_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(matches!(
            CopilotConfig::load(&missing),
            Err(CopilotError::Config(ConfigError::FileNotFound(_)))
        ));
        assert_eq!(
            CopilotConfig::load_or_default(&missing).unwrap().agent.max_tool_calls,
            5
        );

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "agent:\n  max_history: 2\n  preserved_head: 2\n").unwrap();
        assert!(matches!(
            CopilotConfig::load_or_default(&bad),
            Err(CopilotError::Config(ConfigError::InvalidValue { .. }))
        ));
    }
}
