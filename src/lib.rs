//! Hive - Rust 自主任务执行引擎
//!
//! 模块划分：
//! - **action**: 代码执行器接口、工具脚本执行器与多变体步骤执行
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 主控循环、重试预算、恢复、运行阶段、变体执行池
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: 会话历史、会话记录持久化、历史会话检索
//! - **observability**: tracing 初始化与 oracle 输出日志
//! - **oracle**: 感知、规划、汇总三个 LLM 决策函数
//! - **plan**: 计划图
//! - **tools**: 多后端工具路由（MCP stdio / HTTP）

pub mod action;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod oracle;
pub mod plan;
pub mod tools;
