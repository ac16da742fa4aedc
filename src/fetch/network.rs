use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Connectivity as last reported by the embedding application.
#[derive(Debug, Clone)]
pub struct NetworkStatus {
    online: Arc<AtomicBool>,
}

impl NetworkStatus {
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::Relaxed);
        if was != online {
            tracing::info!("Network is now {}", if online { "up" } else { "down" });
        }
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let status = NetworkStatus::default();
        let other = status.clone();
        assert!(other.is_online());

        status.set_online(false);
        assert!(!other.is_online());
    }
}
