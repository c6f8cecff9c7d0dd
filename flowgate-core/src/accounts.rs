//! Account derivation bookkeeping.
//!
//! Concurrent flows draw fresh accounts from one [`KeyRegistry`]; the next
//! unused index is what the output snapshot carries into a follow-up run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Hands out unique, strictly increasing derivation indices.
#[derive(Debug, Clone)]
pub struct KeyRegistry {
    prefix: Arc<str>,
    next: Arc<AtomicU64>,
}

impl KeyRegistry {
    pub fn new(prefix: impl Into<String>, start: u64) -> Self {
        Self {
            prefix: Arc::from(prefix.into()),
            next: Arc::new(AtomicU64::new(start)),
        }
    }

    /// Reserve `n` consecutive indices and return their derivation URIs.
    pub fn create_accounts(&self, n: usize) -> Vec<String> {
        let first = self.next.fetch_add(n as u64, Ordering::SeqCst);
        (first..first + n as u64)
            .map(|index| format!("{}//{}", self.prefix, index))
            .collect()
    }

    pub fn create_account(&self) -> String {
        let first = self.next.fetch_add(1, Ordering::SeqCst);
        format!("{}//{}", self.prefix, first)
    }

    /// First index not yet handed out.
    pub fn next_key_id(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accounts_are_sequential_from_start() {
        let keys = KeyRegistry::new("//testing", 10);
        assert_eq!(
            keys.create_accounts(2),
            vec!["//testing//10".to_string(), "//testing//11".to_string()]
        );
        assert_eq!(keys.create_account(), "//testing//12");
        assert_eq!(keys.next_key_id(), 13);
    }

    #[tokio::test]
    async fn test_concurrent_callers_never_share_an_index() {
        let keys = KeyRegistry::new("//t", 0);
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let keys = keys.clone();
                tokio::spawn(async move { keys.create_accounts(5) })
            })
            .collect();
        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 40);
        assert_eq!(keys.next_key_id(), 40);
    }
}
