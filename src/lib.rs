//! Crane - 自治编码智能体运行时
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、会话取消监督与会话装配
//! - **ledger**: 变更账本（回合索引的追加式版本链与回退）
//! - **model**: 模型客户端抽象、能力画像与实现（OpenAI 兼容 / Mock）
//! - **schedule**: 工具调度（审批门、有界并发、失败阈值）
//! - **subagent**: 受限子代理循环、生命周期监督与历史压缩
//! - **tools**: 工具箱（读取、检索、写入、编辑、Shell、委托）与执行器
//! - **turn**: 回合数据模型、过程事件、畸形调用修复与编排循环

pub mod config;
pub mod core;
pub mod ledger;
pub mod model;
pub mod schedule;
pub mod subagent;
pub mod tools;
pub mod turn;

pub use crate::core::{AgentError, Session};
