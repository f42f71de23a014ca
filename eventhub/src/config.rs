//! 连接配置（HubConfig）
//!
//! 启动时读取一次：broker 连接串、默认 hub 与默认消费组。
//!
use crate::error::{HubError, HubResult};
use crate::metadata::DEFAULT_CONSUMER_GROUP;
use bon::Builder;
use std::env;
use std::fmt;
use std::str::FromStr;

pub const ENV_CONNECTION_STRING: &str = "EVENT_HUB_CONNECTION_STRING";
pub const ENV_HUB_NAME: &str = "EVENT_HUB_NAME";
pub const ENV_CONSUMER_GROUP: &str = "EVENT_HUB_CONSUMER_GROUP";

/// 解析后的连接串：`Endpoint=...;SharedAccessKeyName=...;SharedAccessKey=...;EntityPath=...`
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    endpoint: String,
    shared_access_key_name: Option<String>,
    shared_access_key: Option<String>,
    entity_path: Option<String>,
}

impl ConnectionString {
    pub fn parse(raw: &str) -> HubResult<Self> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut entity_path = None;

        for segment in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            // SharedAccessKey 本身可能含 '='，只按第一个 '=' 切分
            let Some((name, value)) = segment.split_once('=') else {
                return Err(invalid(format!("malformed segment '{segment}'")));
            };
            let value = value.trim();
            if value.is_empty() {
                return Err(invalid(format!("empty value for '{}'", name.trim())));
            }
            match name.trim() {
                "Endpoint" => endpoint = Some(value.to_string()),
                "SharedAccessKeyName" => key_name = Some(value.to_string()),
                "SharedAccessKey" => key = Some(value.to_string()),
                "EntityPath" => entity_path = Some(value.to_string()),
                // 其余键（如 UseDevelopmentEmulator）原样忽略
                _ => {}
            }
        }

        let endpoint = endpoint.ok_or_else(|| invalid("missing 'Endpoint'".to_string()))?;

        Ok(Self {
            endpoint,
            shared_access_key_name: key_name,
            shared_access_key: key,
            entity_path,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn shared_access_key_name(&self) -> Option<&str> {
        self.shared_access_key_name.as_deref()
    }

    pub fn shared_access_key(&self) -> Option<&str> {
        self.shared_access_key.as_deref()
    }

    pub fn entity_path(&self) -> Option<&str> {
        self.entity_path.as_deref()
    }
}

impl FromStr for ConnectionString {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// 不输出密钥
impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("endpoint", &self.endpoint)
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field(
                "shared_access_key",
                &self.shared_access_key.as_ref().map(|_| "***"),
            )
            .field("entity_path", &self.entity_path)
            .finish()
    }
}

fn invalid(reason: String) -> HubError {
    HubError::ConfigInvalid {
        var: ENV_CONNECTION_STRING.to_string(),
        reason,
    }
}

/// 事件中枢配置
#[derive(Debug, Clone, Builder)]
pub struct HubConfig {
    connection: ConnectionString,
    #[builder(into)]
    default_hub: Option<String>,
    #[builder(default = DEFAULT_CONSUMER_GROUP.to_string(), into)]
    default_consumer_group: String,
}

impl HubConfig {
    /// 从环境变量加载
    ///
    /// 必填：`EVENT_HUB_CONNECTION_STRING`
    ///
    /// 可选：
    /// - `EVENT_HUB_NAME`：默认 hub（缺省时回退到连接串的 `EntityPath`）
    /// - `EVENT_HUB_CONSUMER_GROUP`：默认消费组（缺省 `$Default`）
    pub fn from_env() -> HubResult<Self> {
        Self::from_source(|var| env::var(var).ok())
    }

    /// 从任意键值来源加载，便于测试
    pub fn from_source<F>(lookup: F) -> HubResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = lookup(ENV_CONNECTION_STRING).ok_or_else(|| HubError::ConfigMissing {
            var: ENV_CONNECTION_STRING.to_string(),
        })?;
        let connection = ConnectionString::parse(&raw)?;

        let default_hub = lookup(ENV_HUB_NAME).filter(|s| !s.trim().is_empty());
        let default_consumer_group = lookup(ENV_CONSUMER_GROUP)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string());

        Ok(Self {
            connection,
            default_hub,
            default_consumer_group,
        })
    }

    pub fn connection(&self) -> &ConnectionString {
        &self.connection
    }

    pub fn default_consumer_group(&self) -> &str {
        &self.default_consumer_group
    }

    /// 未在注解上指定 hub 时使用的 hub：显式配置优先，其次连接串 `EntityPath`
    pub fn default_hub(&self) -> Option<&str> {
        self.default_hub
            .as_deref()
            .or_else(|| self.connection.entity_path())
    }

    /// 解析注解上的 hub 名
    pub fn resolve_hub<'a>(&'a self, hub_name: Option<&'a str>) -> Option<&'a str> {
        hub_name.or_else(|| self.default_hub())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const RAW: &str = "Endpoint=sb://demo.servicebus.windows.net/;SharedAccessKeyName=send;SharedAccessKey=abc==;EntityPath=users";

    fn source(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn parses_connection_string() {
        let cs = ConnectionString::parse(RAW).unwrap();
        assert_eq!(cs.endpoint(), "sb://demo.servicebus.windows.net/");
        assert_eq!(cs.shared_access_key_name(), Some("send"));
        assert_eq!(cs.shared_access_key(), Some("abc=="));
        assert_eq!(cs.entity_path(), Some("users"));
    }

    #[test]
    fn debug_hides_key() {
        let cs = ConnectionString::parse(RAW).unwrap();
        let dbg = format!("{cs:?}");
        assert!(!dbg.contains("abc=="));
        assert!(dbg.contains("***"));
    }

    #[test]
    fn rejects_malformed_connection_string() {
        assert!(ConnectionString::parse("SharedAccessKey=abc").is_err());
        assert!(ConnectionString::parse("Endpoint").is_err());
        assert!(ConnectionString::parse("Endpoint=;EntityPath=x").is_err());
    }

    #[test]
    fn from_source_requires_connection_string() {
        let err = HubConfig::from_source(source(&[])).unwrap_err();
        assert!(matches!(err, HubError::ConfigMissing { ref var } if var == ENV_CONNECTION_STRING));
    }

    #[test]
    fn default_hub_falls_back_to_entity_path() {
        let cfg = HubConfig::from_source(source(&[(ENV_CONNECTION_STRING, RAW)])).unwrap();
        assert_eq!(cfg.default_hub(), Some("users"));
        assert_eq!(cfg.default_consumer_group(), "$Default");
        assert_eq!(cfg.resolve_hub(Some("orders")), Some("orders"));
        assert_eq!(cfg.resolve_hub(None), Some("users"));
    }

    #[test]
    fn explicit_hub_and_group_win() {
        let cfg = HubConfig::from_source(source(&[
            (ENV_CONNECTION_STRING, RAW),
            (ENV_HUB_NAME, "audit"),
            (ENV_CONSUMER_GROUP, "reporting"),
        ]))
        .unwrap();
        assert_eq!(cfg.default_hub(), Some("audit"));
        assert_eq!(cfg.default_consumer_group(), "reporting");
    }

    #[test]
    fn builder_defaults_consumer_group() {
        let cfg = HubConfig::builder()
            .connection(ConnectionString::parse("Endpoint=sb://localhost").unwrap())
            .build();
        assert_eq!(cfg.default_consumer_group(), "$Default");
        assert_eq!(cfg.default_hub(), None);
        assert_eq!(cfg.resolve_hub(None), None);
    }
}
