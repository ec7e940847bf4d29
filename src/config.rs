//! Configuration types.
//!
//! Everything here is read once at startup and never mutated afterwards.
//! `RunnerConfig::from_env()` reads the process environment; tests go through
//! `from_lookup()` with a map instead of touching process state.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Endpoint used when `RUNNER_SERVER_URL` is not set.
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:3000/api/actions";

/// Default container engine endpoint for the startup probe.
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// Silence tolerated on a connected session before it is torn down.
pub const STALL_SILENCE: Duration = Duration::from_secs(60);

// ── Labels ─────────────────────────────────────────────────────────────

/// How a label's jobs are executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelSchema {
    /// Run directly on the host.
    Host,
    /// Run inside a container built from the given image.
    Docker(String),
}

/// A runner label: `name` or `name:scheme://argument`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub name: String,
    pub schema: LabelSchema,
}

impl FromStr for Label {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidLabel {
            label: raw.to_string(),
            reason: reason.to_string(),
        };

        let (name, target) = match raw.split_once(':') {
            Some((name, target)) => (name.trim(), Some(target.trim())),
            None => (raw.trim(), None),
        };
        if name.is_empty() {
            return Err(invalid("empty label name"));
        }

        let schema = match target {
            None => LabelSchema::Host,
            Some(target) => match target.split_once("://") {
                Some(("docker", image)) if !image.is_empty() => {
                    LabelSchema::Docker(image.to_string())
                }
                Some(("docker", _)) => return Err(invalid("docker label without an image")),
                Some(("host", _)) => LabelSchema::Host,
                Some((scheme, _)) => return Err(invalid(&format!("unsupported scheme {scheme:?}"))),
                None => return Err(invalid("expected scheme://argument after ':'")),
            },
        };

        Ok(Self {
            name: name.to_string(),
            schema,
        })
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            LabelSchema::Host => write!(f, "{}", self.name),
            LabelSchema::Docker(image) => write!(f, "{}:docker://{}", self.name, image),
        }
    }
}

/// Parse and validate a list of raw labels.
pub fn parse_labels<S: AsRef<str>>(raw: &[S]) -> Result<Vec<Label>, ConfigError> {
    raw.iter().map(|l| l.as_ref().parse()).collect()
}

/// Validate raw labels without keeping the parsed form.
pub fn validate_labels<S: AsRef<str>>(raw: &[S]) -> Result<(), ConfigError> {
    parse_labels(raw).map(|_| ())
}

// ── Identity ───────────────────────────────────────────────────────────

/// This runner's identity as seen by the server.
#[derive(Debug, Clone)]
pub struct RunnerIdentity {
    uuid: String,
    name: String,
    labels: Vec<Label>,
    capacity: usize,
}

impl RunnerIdentity {
    /// Create an identity. Capacity must be at least 1.
    pub fn new(
        uuid: impl Into<String>,
        name: impl Into<String>,
        labels: Vec<Label>,
        capacity: usize,
    ) -> Result<Self, ConfigError> {
        let uuid = uuid.into();
        if uuid.trim().is_empty() {
            return Err(ConfigError::MissingEnvVar("RUNNER_UUID".to_string()));
        }
        if capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RUNNER_CAPACITY".to_string(),
                message: "capacity must be at least 1".to_string(),
            });
        }
        Ok(Self {
            uuid,
            name: name.into(),
            labels,
            capacity,
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether any label runs its jobs in a container.
    pub fn needs_container_engine(&self) -> bool {
        self.labels
            .iter()
            .any(|l| matches!(l.schema, LabelSchema::Docker(_)))
    }
}

// ── Policies ───────────────────────────────────────────────────────────

/// What to do once the consecutive read failure threshold is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallPolicy {
    /// Tear the session down and keep reconnecting.
    Reconnect,
    /// Tear the session down and stop the daemon with an error.
    Exit,
}

impl FromStr for StallPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reconnect" => Ok(Self::Reconnect),
            "exit" => Ok(Self::Exit),
            other => Err(format!("expected \"reconnect\" or \"exit\", got {other:?}")),
        }
    }
}

/// Connection and read-loop policy.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Server endpoint.
    pub server_url: String,
    /// Bearer token sent on the handshake.
    pub token: Option<SecretString>,
    /// Spacing between connect attempts while disconnected.
    pub reconnect_interval: Duration,
    /// Upper bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// Sliding read window, pushed forward by every frame received.
    pub read_timeout: Duration,
    /// Client ping cadence while connected. `None` disables pings.
    pub heartbeat_interval: Option<Duration>,
    /// Consecutive non-graceful read failures tolerated before teardown.
    pub max_read_failures: u32,
    pub on_stall: StallPolicy,
    /// Skip server certificate verification on `wss://`.
    pub insecure: bool,
}

impl SessionPolicy {
    /// Failure threshold that tears a silent session down after about
    /// `silence`, given one counted failure per read window.
    pub fn failures_for_silence(silence: Duration, read_timeout: Duration) -> u32 {
        let windows = silence.as_millis() / read_timeout.as_millis().max(1);
        u32::try_from(windows).unwrap_or(u32::MAX).saturating_sub(1).max(1)
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            token: None,
            reconnect_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            heartbeat_interval: Some(Duration::from_secs(5)),
            max_read_failures: Self::failures_for_silence(STALL_SILENCE, Duration::from_secs(10)),
            on_stall: StallPolicy::Reconnect,
            insecure: false,
        }
    }
}

/// Task execution policy.
#[derive(Debug, Clone)]
pub struct TaskPolicy {
    /// Hard wall-clock deadline for one task.
    pub deadline: Duration,
    /// How long shutdown waits to flush cancelled results before closing.
    pub shutdown_grace: Duration,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(3600), // 1 hour
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Settings for the external execution engine.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub program: String,
    /// Arguments placed before the event name.
    pub args: Vec<String>,
    /// Event names this runner accepts.
    pub events: Vec<String>,
    /// Externally reachable artifact cache address handed to tasks.
    pub cache_url: Option<String>,
    pub workdir: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: "act".to_string(),
            args: Vec::new(),
            events: vec!["push".to_string()],
            cache_url: None,
            workdir: None,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub debug: bool,
    pub trace: bool,
    /// Directory for daily-rolling log files, in addition to stderr.
    pub dir: Option<PathBuf>,
}

// ── Full configuration ─────────────────────────────────────────────────

/// Complete runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub identity: RunnerIdentity,
    pub session: SessionPolicy,
    pub task: TaskPolicy,
    pub executor: ExecutorConfig,
    pub log: LogConfig,
    pub docker_host: String,
}

impl RunnerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let uuid = env
            .string("RUNNER_UUID")
            .ok_or_else(|| ConfigError::MissingEnvVar("RUNNER_UUID".to_string()))?;
        let name = env
            .string("RUNNER_NAME")
            .or_else(|| env.string("HOSTNAME"))
            .unwrap_or_else(|| "act-runner".to_string());
        let labels = parse_labels(&env.list("RUNNER_LABELS"))?;
        let capacity = env.parse("RUNNER_CAPACITY", 1usize)?;
        let identity = RunnerIdentity::new(uuid, name, labels, capacity)?;

        let session_defaults = SessionPolicy::default();
        let heartbeat_secs = env.parse("RUNNER_HEARTBEAT_SECS", 5u64)?;
        let read_timeout =
            Duration::from_secs(env.parse("RUNNER_READ_TIMEOUT_SECS", 10u64)?.max(1));
        let session = SessionPolicy {
            server_url: env
                .string("RUNNER_SERVER_URL")
                .unwrap_or(session_defaults.server_url),
            token: env.string("RUNNER_TOKEN").map(SecretString::from),
            reconnect_interval: Duration::from_millis(
                env.parse("RUNNER_RECONNECT_INTERVAL_MS", 1000u64)?.max(1),
            ),
            connect_timeout: Duration::from_secs(env.parse("RUNNER_CONNECT_TIMEOUT_SECS", 10u64)?),
            read_timeout,
            heartbeat_interval: (heartbeat_secs > 0).then(|| Duration::from_secs(heartbeat_secs)),
            max_read_failures: env.parse(
                "RUNNER_MAX_READ_FAILURES",
                SessionPolicy::failures_for_silence(STALL_SILENCE, read_timeout),
            )?,
            on_stall: env.parse("RUNNER_ON_STALL", StallPolicy::Reconnect)?,
            insecure: env.flag("RUNNER_INSECURE")?,
        };

        let task = TaskPolicy {
            deadline: Duration::from_secs(env.parse("RUNNER_TASK_TIMEOUT_SECS", 3600u64)?),
            shutdown_grace: Duration::from_secs(env.parse("RUNNER_SHUTDOWN_GRACE_SECS", 5u64)?),
        };

        let events = env.list("RUNNER_EVENTS");
        let executor = ExecutorConfig {
            program: env.string("RUNNER_EXEC_COMMAND").unwrap_or_else(|| "act".to_string()),
            args: env
                .string("RUNNER_EXEC_ARGS")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            events: if events.is_empty() {
                vec!["push".to_string()]
            } else {
                events
            },
            cache_url: env.string("RUNNER_CACHE_URL"),
            workdir: env.string("RUNNER_WORKDIR").map(PathBuf::from),
        };

        let log = LogConfig {
            debug: env.flag("RUNNER_DEBUG")?,
            trace: env.flag("RUNNER_TRACE")?,
            dir: env.string("RUNNER_LOG_DIR").map(PathBuf::from),
        };

        Ok(Self {
            identity,
            session,
            task,
            executor,
            log,
            docker_host: env
                .string("DOCKER_HOST")
                .unwrap_or_else(|| DEFAULT_DOCKER_HOST.to_string()),
        })
    }
}

/// Typed accessors over a key lookup.
struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.string(key)
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
        }
    }

    fn flag(&self, key: &str) -> Result<bool, ConfigError> {
        match self.string(key).as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("0") | Some("false") | Some("no") => Ok(false),
            Some("1") | Some("true") | Some("yes") => Ok(true),
            Some(other) => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got {other:?}"),
            }),
        }
    }
}
