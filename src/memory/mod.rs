//! 记忆层：会话内事实的追加与检索

pub mod fact;
pub mod in_memory;

pub use fact::{Fact, FactKind, MemoryStore};
pub use in_memory::InMemoryFactStore;
