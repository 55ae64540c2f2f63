//! 知识库：事实模型与合并规则

pub mod facts;
pub mod merger;

pub use facts::{
    Credential, CredentialReport, FactBatch, FactStore, Severity, Target, TargetUpdate,
    Vulnerability, VulnerabilityReport,
};
pub use merger::{FactMerger, FactSummary};
