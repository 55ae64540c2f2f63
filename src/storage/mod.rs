//! 存储层：会话状态文档

pub mod persistence;

pub use persistence::PersistenceManager;
