//! LLM 配置加载
//!
//! 从环境变量读取模型配置，格式：
//! ```text
//! COPILOT_MODEL_<ID>_MODEL=gpt-4o
//! COPILOT_MODEL_<ID>_BASEURL=https://api.openai.com/v1/chat/completions
//! COPILOT_MODEL_<ID>_APIKEY=sk-...
//! ```
//! `<ID>` 为自定义标识（如 `GPT4O`、`QWEN`），不区分大小写。

use std::collections::HashMap;

use dotenv::dotenv;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

const PREFIX: &str = "COPILOT_MODEL_";

/// 单个模型的连接配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ModelConfig {
    /// LLM 接口中使用的模型名（如 `gpt-4o`）
    pub model: String,
    /// Chat Completions 接口完整 URL
    pub baseurl: String,
    pub apikey: String,
}

/// 已加载的模型配置表（key = model 字段值）
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ModelRegistry {
    pub models: HashMap<String, ModelConfig>,
}

impl ModelRegistry {
    /// 读取 `.env` 与进程环境变量
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        let mut model_configs: HashMap<String, HashMap<String, String>> = HashMap::new();
        for (key, value) in vars {
            let Some(suffix) = key.strip_prefix(PREFIX) else {
                continue;
            };
            let parts: Vec<&str> = suffix.split('_').collect();
            if parts.len() != 2 {
                return Err(ConfigError::EnvFormatError(key).into());
            }
            let model_id = parts[0].to_lowercase();
            let config_key = parts[1].to_lowercase();

            match config_key.as_str() {
                "model" | "baseurl" | "apikey" => {}
                _ => return Err(ConfigError::UnMatchConfigError(config_key, key).into()),
            }
            model_configs
                .entry(model_id)
                .or_default()
                .insert(config_key, value);
        }

        let mut models = HashMap::new();
        for (model_id, mut config_map) in model_configs {
            let mut take = |field: &str| {
                config_map
                    .remove(field)
                    .ok_or_else(|| ConfigError::MissingConfig(model_id.clone(), field.to_string()))
            };
            let model = take("model")?;
            let baseurl = take("baseurl")?;
            let apikey = take("apikey")?;
            models.insert(
                model.clone(),
                ModelConfig {
                    model,
                    baseurl,
                    apikey,
                },
            );
        }

        Ok(Self { models })
    }

    pub fn get(&self, model: &str) -> Result<ModelConfig> {
        self.models
            .get(model)
            .cloned()
            .ok_or_else(|| ConfigError::NotFindModelError(model.to_string()).into())
    }

    /// 仅配置了一个模型时无需指定名称
    pub fn single(&self) -> Option<&ModelConfig> {
        if self.models.len() == 1 {
            self.models.values().next()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CopilotError;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_loads_complete_model() {
        let registry = ModelRegistry::from_vars(vars(&[
            ("COPILOT_MODEL_QWEN_MODEL", "qwen-plus"),
            ("COPILOT_MODEL_QWEN_BASEURL", "https://example.com/v1/chat/completions"),
            ("COPILOT_MODEL_QWEN_APIKEY", "sk-test"),
            ("PATH", "/usr/bin"),
        ]))
        .unwrap();
        let model = registry.get("qwen-plus").unwrap();
        assert_eq!(model.apikey, "sk-test");
        assert_eq!(registry.single().unwrap().model, "qwen-plus");
    }

    #[test]
    fn test_missing_field_is_reported() {
        let err = ModelRegistry::from_vars(vars(&[("COPILOT_MODEL_QWEN_MODEL", "qwen-plus")]))
            .unwrap_err();
        assert!(matches!(
            err,
            CopilotError::Config(ConfigError::MissingConfig(_, _))
        ));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = ModelRegistry::from_vars(vars(&[("COPILOT_MODEL_QWEN_TOKEN", "x")])).unwrap_err();
        assert!(matches!(
            err,
            CopilotError::Config(ConfigError::UnMatchConfigError(_, _))
        ));
    }
}
