use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::store::TicketStore;

/// Process-lifetime cache over the category reference table. Only answers the
/// store actually gave are remembered; lookup errors fail open.
pub struct CategoryCache {
    store: Arc<dyn TicketStore>,
    known: RwLock<HashMap<i64, bool>>,
}

impl CategoryCache {
    pub fn new(store: Arc<dyn TicketStore>) -> Self {
        Self {
            store,
            known: RwLock::new(HashMap::new()),
        }
    }

    pub async fn exists(&self, code: i64) -> bool {
        if let Some(hit) = self.known.read().await.get(&code) {
            return *hit;
        }
        match self.store.category_exists(code).await {
            Ok(exists) => {
                self.known.write().await.insert(code, exists);
                exists
            }
            Err(e) => {
                tracing::warn!(category = code, error = %e, "category lookup failed, assuming it exists");
                true
            }
        }
    }
}
