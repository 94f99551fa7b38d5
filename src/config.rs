use std::{path::PathBuf, time::Duration};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    constants::{DEFAULT_COMPILE_MEMORY_BYTES, DEFAULT_FILE_SIZE_BYTES, DEFAULT_MAX_PROCESSES},
    core::{
        domain::{Language, ResourceLimits},
        errors::{LimitsError, UnsupportedLanguage},
        pipeline::scheduler::SchedulerConfig,
    },
};

const SYSTEM_CONFIG: &str = "/etc/coderunner/judge";
const ENV_PREFIX: &str = "JUDGE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot load config: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("invalid default limits: {0}")]
    Limits(#[from] LimitsError),
    #[error(transparent)]
    Language(#[from] UnsupportedLanguage),
    #[error("uid range {0}..={1} is empty")]
    UidRange(u32, u32),
}

/// Judge configuration: built-in defaults, then the system file, then an
/// optional caller file, then `JUDGE__*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    pub max_concurrent_workers: usize,
    pub queue_capacity: usize,
    /// Limits applied when a request leaves them out.
    pub default_limits: LimitsConfig,
    pub compile_time_ceiling_ms: u64,
    pub compile_memory_bytes: u64,
    /// Added to the wall time limit to get the pipeline ceiling of one
    /// submission. Covers provisioning and compilation.
    pub provisioning_overhead_ms: u64,
    pub drain_timeout_ms: u64,
    pub circuit_breaker: CircuitBreakerConfig,
    pub sandbox: SandboxConfig,
    /// Enabled subset of the built-in runners, by name or numeric id.
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub cpu_time_ms: u64,
    pub wall_time_ms: u64,
    pub memory_bytes: u64,
    pub output_byte_cap: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive infrastructure faults before admissions stop; 0 disables.
    pub threshold: u32,
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Parent of every per-submission working directory.
    pub root: PathBuf,
    /// Delegated cgroup v2 directory the sandbox groups are created in.
    /// Defaults to the cgroup the judge was started in.
    pub cgroup_root: Option<PathBuf>,
    /// Inclusive range of unprivileged uids handed out one per sandbox.
    /// A judge running as root falls back to a built-in range; otherwise
    /// programs keep the judge's uid behind a user namespace.
    pub uid_range: Option<(u32, u32)>,
    pub max_processes: u64,
    pub file_size_bytes: u64,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        JudgeConfig {
            max_concurrent_workers: 4,
            queue_capacity: 64,
            default_limits: LimitsConfig::default(),
            compile_time_ceiling_ms: 10_000,
            compile_memory_bytes: DEFAULT_COMPILE_MEMORY_BYTES,
            provisioning_overhead_ms: 15_000,
            drain_timeout_ms: 30_000,
            circuit_breaker: CircuitBreakerConfig::default(),
            sandbox: SandboxConfig::default(),
            languages: Language::ALL
                .iter()
                .map(|language| language.name().to_string())
                .collect(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        ResourceLimits::default().into()
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            root: std::env::temp_dir().join("coderunner-judge"),
            cgroup_root: None,
            uid_range: None,
            max_processes: DEFAULT_MAX_PROCESSES,
            file_size_bytes: DEFAULT_FILE_SIZE_BYTES,
        }
    }
}

impl From<ResourceLimits> for LimitsConfig {
    fn from(limits: ResourceLimits) -> Self {
        LimitsConfig {
            cpu_time_ms: limits.cpu_time_ms,
            wall_time_ms: limits.wall_time_ms,
            memory_bytes: limits.memory_bytes,
            output_byte_cap: limits.output_byte_cap,
        }
    }
}

impl From<LimitsConfig> for ResourceLimits {
    fn from(limits: LimitsConfig) -> Self {
        ResourceLimits {
            cpu_time_ms: limits.cpu_time_ms,
            wall_time_ms: limits.wall_time_ms,
            memory_bytes: limits.memory_bytes,
            output_byte_cap: limits.output_byte_cap,
        }
    }
}

impl From<&JudgeConfig> for SchedulerConfig {
    fn from(config: &JudgeConfig) -> Self {
        SchedulerConfig {
            max_concurrent_workers: config.max_concurrent_workers,
            queue_capacity: config.queue_capacity,
            circuit_breaker_threshold: config.circuit_breaker.threshold,
            circuit_breaker_cooldown: Duration::from_millis(config.circuit_breaker.cooldown_ms),
        }
    }
}

impl JudgeConfig {
    /// Loads and validates the configuration. A missing file is not an error.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder()
            .add_source(::config::File::with_name(SYSTEM_CONFIG).required(false));
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: JudgeConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_workers == 0 {
            return Err(ConfigError::Zero("max_concurrent_workers"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue_capacity"));
        }
        if self.compile_time_ceiling_ms == 0 {
            return Err(ConfigError::Zero("compile_time_ceiling_ms"));
        }
        if self.compile_memory_bytes == 0 {
            return Err(ConfigError::Zero("compile_memory_bytes"));
        }
        if self.sandbox.max_processes == 0 {
            return Err(ConfigError::Zero("sandbox.max_processes"));
        }
        if let Some((first, last)) = self.sandbox.uid_range {
            if first > last {
                return Err(ConfigError::UidRange(first, last));
            }
        }
        self.default_limits().validate()?;
        self.enabled_languages()?;
        Ok(())
    }

    pub fn default_limits(&self) -> ResourceLimits {
        self.default_limits.into()
    }

    pub fn enabled_languages(&self) -> Result<Vec<Language>, UnsupportedLanguage> {
        self.languages.iter().map(|name| name.parse()).collect()
    }

    pub fn compile_time_ceiling(&self) -> Duration {
        Duration::from_millis(self.compile_time_ceiling_ms)
    }

    pub fn provisioning_overhead(&self) -> Duration {
        Duration::from_millis(self.provisioning_overhead_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = JudgeConfig::default();

        config.validate().unwrap();
        assert_eq!(config.enabled_languages().unwrap(), Language::ALL.to_vec());
        assert_eq!(config.default_limits(), ResourceLimits::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
max_concurrent_workers = 2
queue_capacity = 8
languages = ["cpp", "71"]

[default_limits]
cpu_time_ms = 500
wall_time_ms = 1000

[circuit_breaker]
threshold = 0

[sandbox]
root = "/var/lib/judge"
cgroup_root = "/sys/fs/cgroup/judge.slice"
uid_range = [60000, 60063]
"#
        )
        .unwrap();

        let config = JudgeConfig::load(file.path().to_str()).unwrap();

        assert_eq!(config.max_concurrent_workers, 2);
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(
            config.enabled_languages().unwrap(),
            vec![Language::Cpp, Language::Python]
        );
        assert_eq!(config.default_limits.cpu_time_ms, 500);
        assert_eq!(
            config.default_limits.memory_bytes,
            ResourceLimits::default().memory_bytes
        );
        assert_eq!(config.circuit_breaker.threshold, 0);
        assert_eq!(config.sandbox.root, PathBuf::from("/var/lib/judge"));
        assert_eq!(
            config.sandbox.cgroup_root,
            Some(PathBuf::from("/sys/fs/cgroup/judge.slice"))
        );
        assert_eq!(config.sandbox.uid_range, Some((60000, 60063)));
        assert_eq!(config.sandbox.max_processes, DEFAULT_MAX_PROCESSES);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero_workers = JudgeConfig {
            max_concurrent_workers: 0,
            ..JudgeConfig::default()
        };
        assert!(matches!(
            zero_workers.validate(),
            Err(ConfigError::Zero("max_concurrent_workers"))
        ));

        let zero_queue = JudgeConfig {
            queue_capacity: 0,
            ..JudgeConfig::default()
        };
        assert!(matches!(
            zero_queue.validate(),
            Err(ConfigError::Zero("queue_capacity"))
        ));

        let bad_limits = JudgeConfig {
            default_limits: LimitsConfig {
                cpu_time_ms: 2000,
                wall_time_ms: 1000,
                ..LimitsConfig::default()
            },
            ..JudgeConfig::default()
        };
        assert!(matches!(
            bad_limits.validate(),
            Err(ConfigError::Limits(LimitsError::WallBelowCpu { .. }))
        ));

        let unknown_language = JudgeConfig {
            languages: vec!["cobol".to_string()],
            ..JudgeConfig::default()
        };
        assert!(matches!(
            unknown_language.validate(),
            Err(ConfigError::Language(_))
        ));

        let mut reversed_uids = JudgeConfig::default();
        reversed_uids.sandbox.uid_range = Some((10, 5));
        assert!(matches!(
            reversed_uids.validate(),
            Err(ConfigError::UidRange(10, 5))
        ));
    }

    #[test]
    fn test_scheduler_config_from_judge_config() {
        let config = JudgeConfig {
            max_concurrent_workers: 3,
            queue_capacity: 7,
            circuit_breaker: CircuitBreakerConfig {
                threshold: 2,
                cooldown_ms: 1500,
            },
            ..JudgeConfig::default()
        };

        assert_eq!(
            SchedulerConfig::from(&config),
            SchedulerConfig {
                max_concurrent_workers: 3,
                queue_capacity: 7,
                circuit_breaker_threshold: 2,
                circuit_breaker_cooldown: Duration::from_millis(1500),
            }
        );
    }
}
