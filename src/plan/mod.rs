//! 计划图：步骤节点、谱系边、版本化全局变量区

pub mod graph;
pub mod types;

pub use graph::PlanGraph;
pub use types::*;
