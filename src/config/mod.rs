use serde::Deserialize;
use std::time::Duration;

/// 기본 대기 시간 (초) — fork/exit 핸드셰이크 상한, 서버 수명과는 무관
pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 5;

/// Supervisor configuration.
///
/// The wait bound caps how long a helper may take to exit (short-lived
/// tools) or to fork after binding its listener (backgrounding servers).
/// The reference value of 5 seconds suits fast-failing tools; deployments
/// running the plugin host under load can raise it here instead of
/// patching a constant.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SupervisorConfig {
    pub wait_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: DEFAULT_WAIT_TIMEOUT_SECS,
        }
    }
}

impl SupervisorConfig {
    /// Load from `config/nbdbak.toml`, falling back to defaults when the
    /// file is absent or partial. `NBDBAK_CONFIG` overrides the path
    /// (테스트/개발용).
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("NBDBAK_CONFIG")
            .unwrap_or_else(|_| "config/nbdbak.toml".to_string());
        let s = std::fs::read_to_string(&path).unwrap_or_default();
        let cfg = toml::from_str(&s).unwrap_or_default();
        Ok(cfg)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}
