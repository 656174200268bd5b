//! TTL'd thought-signature cache (in-process tier + persisted tier).
//!
//! The upstream validates that an assistant tool_use is preceded by a
//! thinking block whose signature matches. Proxy clients do not replay the
//! signature, so it is captured from the last streamed response here and
//! re-inserted on the next turn that references the same tool-call id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use agpool_common::now_ms;
use agpool_storage::SqliteStore;
use agpool_translate::ThoughtSignatures;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureKind {
    /// functionCall id → opaque signature (Gemini replay).
    ToolThought,
    /// tool_use id → { signature, thought text } (Claude replay).
    ClaudeToolThinking,
}

impl SignatureKind {
    fn prefix(&self) -> &'static str {
        match self {
            SignatureKind::ToolThought => "tool_thought_signature",
            SignatureKind::ClaudeToolThinking => "claude_tool_thinking",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "tool_thought_signature" => Some(SignatureKind::ToolThought),
            "claude_tool_thinking" => Some(SignatureKind::ClaudeToolThinking),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    signature: String,
    thought_text: Option<String>,
    saved_at: i64,
}

pub struct SignatureCache {
    ttl_ms: i64,
    entries: Mutex<HashMap<(SignatureKind, String), Entry>>,
    store: Option<Arc<SqliteStore>>,
}

impl SignatureCache {
    pub fn new(ttl_ms: u64, store: Option<Arc<SqliteStore>>) -> Self {
        Self {
            ttl_ms: ttl_ms as i64,
            entries: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Load the persisted tier; expired rows are swept while we are at it.
    pub async fn load_persisted(&self) {
        let Some(store) = &self.store else { return };
        let cutoff = now_ms() - self.ttl_ms;
        if let Err(err) = store.sweep_signatures_before(cutoff).await {
            tracing::debug!(error = %err, "signature sweep failed");
        }
        match store.load_signatures().await {
            Ok(rows) => {
                let mut entries = self.entries.lock().unwrap();
                for row in rows {
                    let Some((prefix, id)) = row.key.split_once(':') else {
                        continue;
                    };
                    let Some(kind) = SignatureKind::from_prefix(prefix) else {
                        continue;
                    };
                    entries.insert(
                        (kind, id.to_string()),
                        Entry {
                            signature: row.signature,
                            thought_text: row.thought_text,
                            saved_at: row.saved_at,
                        },
                    );
                }
                tracing::info!(count = entries.len(), "signature cache loaded");
            }
            Err(err) => tracing::warn!(error = %err, "signature cache load failed"),
        }
    }

    fn get(&self, kind: SignatureKind, id: &str) -> Option<Entry> {
        let key = (kind, id.to_string());
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get(&key)?;
        if now_ms() - entry.saved_at > self.ttl_ms {
            entries.remove(&key);
            return None;
        }
        Some(entry.clone())
    }

    fn put(&self, kind: SignatureKind, id: &str, signature: &str, thought_text: Option<&str>) {
        let saved_at = now_ms();
        self.entries.lock().unwrap().insert(
            (kind, id.to_string()),
            Entry {
                signature: signature.to_string(),
                thought_text: thought_text.map(|t| t.to_string()),
                saved_at,
            },
        );
        if let Some(store) = &self.store {
            let store = store.clone();
            let key = format!("{}:{id}", kind.prefix());
            let signature = signature.to_string();
            let thought_text = thought_text.map(|t| t.to_string());
            tokio::spawn(async move {
                if let Err(err) = store
                    .put_signature(&key, &signature, thought_text.as_deref(), saved_at)
                    .await
                {
                    tracing::debug!(error = %err, "signature persist failed");
                }
            });
        }
    }

    #[cfg(test)]
    fn put_at(&self, kind: SignatureKind, id: &str, signature: &str, saved_at: i64) {
        self.entries.lock().unwrap().insert(
            (kind, id.to_string()),
            Entry {
                signature: signature.to_string(),
                thought_text: None,
                saved_at,
            },
        );
    }
}

impl ThoughtSignatures for SignatureCache {
    fn tool_signature(&self, tool_call_id: &str) -> Option<String> {
        self.get(SignatureKind::ToolThought, tool_call_id)
            .map(|e| e.signature)
    }

    fn claude_thinking(&self, tool_call_id: &str) -> Option<(String, String)> {
        self.get(SignatureKind::ClaudeToolThinking, tool_call_id)
            .map(|e| (e.signature, e.thought_text.unwrap_or_default()))
    }

    fn remember_tool_signature(&self, tool_call_id: &str, signature: &str) {
        self.put(SignatureKind::ToolThought, tool_call_id, signature, None);
    }

    fn remember_claude_thinking(&self, tool_call_id: &str, signature: &str, thought_text: &str) {
        self.put(
            SignatureKind::ClaudeToolThinking,
            tool_call_id,
            signature,
            Some(thought_text),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_entries_read_as_missing() {
        let cache = SignatureCache::new(1_000, None);
        cache.put_at(SignatureKind::ToolThought, "call_1", "sig", now_ms() - 5_000);
        assert!(cache.tool_signature("call_1").is_none());
        // Lazy eviction removed the row.
        assert!(cache.entries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn round_trip_within_ttl() {
        let cache = SignatureCache::new(60_000, None);
        cache.remember_claude_thinking("toolu_1", "sig-x", "thought");
        assert_eq!(
            cache.claude_thinking("toolu_1"),
            Some(("sig-x".to_string(), "thought".to_string()))
        );
        assert!(cache.claude_thinking("toolu_2").is_none());
    }
}
