//! 进程内事实存储：关键词重叠打分，分数相同按时间新近排序
//!
//! 不做持久化，进程退出即丢失；超过容量时淘汰最旧条目。

use std::collections::HashSet;
use std::sync::RwLock;

use crate::core::AgentError;
use crate::memory::{Fact, MemoryStore};

/// 将文本切分为小写词集合，用于简单相似度（词重叠数）
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric() && c != '_')
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() > 1)
        .collect()
}

struct StoredFact {
    fact: Fact,
    tokens: HashSet<String>,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    facts: Vec<StoredFact>,
    next_seq: u64,
}

/// 简单内存实现：按关键词重叠检索（无真实向量）
pub struct InMemoryFactStore {
    inner: RwLock<Inner>,
    max_entries: usize,
}

impl InMemoryFactStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.facts.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryFactStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl MemoryStore for InMemoryFactStore {
    fn add(&self, fact: Fact) -> Result<(), AgentError> {
        let mut tokens = tokenize_lower(&fact.text);
        tokens.extend(fact.tags.iter().map(|t| t.to_lowercase()));
        let mut inner = self
            .inner
            .write()
            .map_err(|e| AgentError::Storage(e.to_string()))?;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.facts.push(StoredFact { fact, tokens, seq });
        let n = inner.facts.len();
        if n > self.max_entries {
            inner.facts.drain(0..n - self.max_entries);
        }
        Ok(())
    }

    fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        session_filter: Option<&str>,
    ) -> Result<Vec<Fact>, AgentError> {
        let query_tokens = tokenize_lower(query);
        let inner = self
            .inner
            .read()
            .map_err(|e| AgentError::Storage(e.to_string()))?;
        let mut scored: Vec<(usize, u64, &Fact)> = inner
            .facts
            .iter()
            .filter(|s| session_filter.map_or(true, |key| s.fact.session_key == key))
            .map(|s| (query_tokens.intersection(&s.tokens).count(), s.seq, &s.fact))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(_, _, f)| f.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FactKind;

    fn fact(text: &str, session: &str) -> Fact {
        Fact::new(text, FactKind::Fact, "q", session)
    }

    #[test]
    fn test_retrieve_ranks_by_overlap() {
        let store = InMemoryFactStore::default();
        store.add(fact("the sky is blue", "s1")).unwrap();
        store.add(fact("add returned 4", "s1")).unwrap();
        let got = store.retrieve("what did add return", 5, Some("s1")).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].text, "add returned 4");
    }

    #[test]
    fn test_session_filter() {
        let store = InMemoryFactStore::default();
        store.add(fact("alpha beta", "s1")).unwrap();
        store.add(fact("alpha gamma", "s2")).unwrap();
        let got = store.retrieve("alpha", 5, Some("s2")).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].session_key, "s2");
        assert_eq!(store.retrieve("alpha", 5, None).unwrap().len(), 2);
    }

    #[test]
    fn test_recency_breaks_ties_and_top_k() {
        let store = InMemoryFactStore::default();
        for i in 0..4 {
            store.add(fact(&format!("note {i}"), "s")).unwrap();
        }
        let got = store.retrieve("unrelated", 2, Some("s")).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].text, "note 3");
        assert_eq!(got[1].text, "note 2");
    }

    #[test]
    fn test_empty_store_returns_empty() {
        let store = InMemoryFactStore::default();
        assert!(store.retrieve("anything", 5, Some("s")).unwrap().is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let store = InMemoryFactStore::new(2);
        store.add(fact("one", "s")).unwrap();
        store.add(fact("two", "s")).unwrap();
        store.add(fact("three", "s")).unwrap();
        assert_eq!(store.len(), 2);
        let texts: Vec<_> = store
            .retrieve("", 5, None)
            .unwrap()
            .into_iter()
            .map(|f| f.text)
            .collect();
        assert_eq!(texts, vec!["three", "two"]);
    }

    #[test]
    fn test_tags_are_searchable() {
        let store = InMemoryFactStore::default();
        store
            .add(fact("result 42", "s").with_tool("multiply").with_tag("multiply"))
            .unwrap();
        let got = store.retrieve("multiply", 1, Some("s")).unwrap();
        assert_eq!(got[0].tool_name.as_deref(), Some("multiply"));
    }
}
