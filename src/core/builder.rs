//! Agent 构建器：从 AppConfig 组装 LLM、工具路由、三个 oracle、执行器与记忆检索
//!
//! 二进制入口与测试共用同一套初始化逻辑；各协作者都可以在 build 前替换。

use std::path::PathBuf;
use std::sync::Arc;

use crate::action::{CodeRunner, StepExecutor, ToolScriptRunner};
use crate::config::AppConfig;
use crate::core::{AgentLoop, VariantPool};
use crate::llm::{create_llm_from_config, LlmClient};
use crate::memory::{MemorySearch, SessionLogStore, SessionMemoryIndex};
use crate::oracle::{self, load_prompt, LlmPerceiver, LlmPlanner, LlmSummarizer};
use crate::tools::{BackendConnector, McpConnector, ToolRouter};

pub struct AgentBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    connector: Option<Box<dyn BackendConnector>>,
    memory: Option<Arc<dyn MemorySearch>>,
    runner: Option<Arc<dyn CodeRunner>>,
    pool: VariantPool,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            connector: None,
            memory: None,
            runner: None,
            pool: VariantPool::default(),
        }
    }

    /// 替换 LLM 客户端（默认按配置选择）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 替换工具后端连接器（默认 McpConnector）
    pub fn with_connector(mut self, connector: Box<dyn BackendConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemorySearch>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_code_runner(mut self, runner: Arc<dyn CodeRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn with_pool(mut self, pool: VariantPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 按配置顺序连接全部工具后端；失败的后端被跳过
    pub async fn build_tool_router(&self) -> ToolRouter {
        let mut router = ToolRouter::new();
        match &self.connector {
            Some(connector) => router.initialize(&self.config.mcp_servers, connector.as_ref()).await,
            None => router.initialize(&self.config.mcp_servers, &McpConnector).await,
        }
        tracing::info!(
            backends = router.backend_ids().len(),
            tools = router.tool_names().len(),
            "tool router ready"
        );
        router
    }

    /// 历史会话检索：默认扫描会话日志目录
    pub fn build_memory(&self) -> Arc<dyn MemorySearch> {
        match &self.memory {
            Some(memory) => memory.clone(),
            None => Arc::new(SessionMemoryIndex::new(&self.config.app.session_log_dir)),
        }
    }

    pub async fn build(self) -> AgentComponents {
        let llm = self
            .llm
            .clone()
            .unwrap_or_else(|| create_llm_from_config(&self.config));
        let tools = Arc::new(self.build_tool_router().await);
        let memory = self.build_memory();
        let prompts = &self.config.prompts;

        let perceiver = LlmPerceiver::new(
            llm.clone(),
            load_prompt(&prompts.perception, oracle::perception::BUILTIN_PROMPT),
        );
        let planner = LlmPlanner::new(
            llm.clone(),
            load_prompt(&prompts.decision, oracle::decision::BUILTIN_PROMPT),
            tools.clone(),
        );
        let summarizer = LlmSummarizer::new(
            llm.clone(),
            load_prompt(&prompts.summarizer, oracle::summarizer::BUILTIN_PROMPT),
        );
        let runner = self
            .runner
            .clone()
            .unwrap_or_else(|| Arc::new(ToolScriptRunner::new()));
        let executor = StepExecutor::new(runner, tools.clone(), self.pool.clone());

        let agent = AgentLoop::new(
            Arc::new(perceiver),
            Arc::new(planner),
            Arc::new(summarizer),
            executor,
            memory,
            SessionLogStore::new(&self.config.app.session_log_dir),
            self.config.agent.clone(),
            self.config.app.memory_top_k,
        );

        AgentComponents {
            agent,
            tools,
            llm,
            config: self.config,
        }
    }
}

/// 组装完成的运行时；tools 需在退出前 shutdown
pub struct AgentComponents {
    pub agent: AgentLoop,
    pub tools: Arc<ToolRouter>,
    pub llm: Arc<dyn LlmClient>,
    pub config: AppConfig,
}

/// 便捷函数：加载配置（失败时使用默认值）并创建构建器
///
/// 调用时日志可能尚未初始化，加载失败同时输出到 stderr
pub fn create_agent_builder(config_path: Option<PathBuf>) -> AgentBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        eprintln!("Config load failed ({e}), using defaults");
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    AgentBuilder::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OutcomeStatus;
    use crate::llm::MockLlmClient;
    use crate::memory::NoopMemory;

    #[tokio::test]
    async fn test_build_with_mock_llm_summarizes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.app.session_log_dir = dir.path().to_path_buf();

        let components = AgentBuilder::new(config)
            .with_llm(Arc::new(MockLlmClient))
            .with_memory(Arc::new(NoopMemory))
            .build()
            .await;
        assert!(components.tools.is_empty());

        let outcome = components.agent.run("What is 2+3?").await;
        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert!(outcome.record_path.is_some_and(|p| p.starts_with(dir.path())));
        components.tools.shutdown().await;
    }

    #[tokio::test]
    async fn test_later_runs_recall_earlier_runs_of_same_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.app.session_log_dir = dir.path().to_path_buf();

        let components = AgentBuilder::new(config)
            .with_llm(Arc::new(MockLlmClient))
            .build()
            .await;
        let first = components.agent.run("What is 2+3?").await;
        assert!(first.is_success());

        let second = components.agent.run("What is 2+3?").await;
        let record = SessionLogStore::new(dir.path())
            .load(&second.record_path.unwrap())
            .unwrap();
        let memory = record.context.globals["memory"].as_array().unwrap().clone();
        assert_eq!(memory.len(), 1);
        assert_eq!(memory[0]["session_id"], first.session_id.as_str());
    }
}
