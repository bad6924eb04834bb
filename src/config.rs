//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__AGENT__MAX_STEPS=20`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::action::ExecutionMode;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub agent: AgentSection,
    pub llm: LlmSection,
    pub prompts: PromptsSection,
    /// 工具后端，按配置顺序初始化（重名工具后者胜出）
    pub mcp_servers: Vec<McpServerConfig>,
}

/// [app] 段：应用名、会话日志目录、记忆检索条数、日志格式
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    pub session_log_dir: PathBuf,
    /// 启动运行时检索的历史会话条数
    pub memory_top_k: usize,
    pub log_format: LogFormat,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            session_log_dir: PathBuf::from("memory/session_logs"),
            memory_top_k: 3,
            log_format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// [agent] 段：循环预算、执行模式、规划策略与重规划策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_steps: usize,
    pub max_retries: usize,
    pub execution_mode: ExecutionMode,
    /// 透传给 Planner 的策略名（exploratory / conservative）
    pub planning_strategy: String,
    pub replan_policy: ReplanPolicy,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_steps: crate::core::retry::DEFAULT_MAX_STEPS,
            max_retries: crate::core::retry::DEFAULT_MAX_RETRIES,
            execution_mode: ExecutionMode::default(),
            planning_strategy: "exploratory".to_string(),
            replan_policy: ReplanPolicy::default(),
        }
    }
}

/// 非 ROOT 步骤耗尽重试预算、目标回到 ROOT 后如何处理已有计划图
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplanPolicy {
    /// 保留整张图，失败节点保持 failed，重新规划的节点挂到 ROOT 下
    #[default]
    Keep,
    /// 额外将耗尽预算的步骤及其后代重命名（后缀 `X<n>`），释放原 ID 给新计划
    ArchiveSubtree,
}

/// [llm] 段：后端选择
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock；优先级由 API Key 与 provider 共同决定
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
            base_url: None,
        }
    }
}

/// [prompts] 段：三个 oracle 的提示词模板路径；文件缺失时使用内置模板
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptsSection {
    pub perception: PathBuf,
    pub decision: PathBuf,
    pub summarizer: PathBuf,
}

impl Default for PromptsSection {
    fn default() -> Self {
        Self {
            perception: PathBuf::from("config/prompts/perception.txt"),
            decision: PathBuf::from("config/prompts/decision.txt"),
            summarizer: PathBuf::from("config/prompts/summarizer.txt"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// 本地子进程，stdin/stdout 逐行 JSON
    #[default]
    Stdio,
    /// 远程流式 HTTP 端点
    Http,
}

/// [[mcp_servers]] 条目
#[derive(Debug, Clone, Deserialize, Default)]
pub struct McpServerConfig {
    pub id: String,
    #[serde(default)]
    pub transport: TransportKind,
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub url: Option<String>,
    pub description: Option<String>,
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
