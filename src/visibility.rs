use std::sync::Arc;

use tokio::sync::watch;

/// Foreground/background state of the page, shared by its polling timers.
///
/// Clones observe the same flag. Pages start visible.
#[derive(Debug, Clone)]
pub struct Visibility {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Visibility {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Visibility {
    pub fn new(visible: bool) -> Self {
        let (tx, _) = watch::channel(visible);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_visible(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn set_visible(&self, visible: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == visible {
                false
            } else {
                *current = visible;
                true
            }
        });
        if changed {
            tracing::debug!(visible, "Page visibility changed");
        }
    }

    /// Watch visibility changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_visible_by_default() {
        assert!(Visibility::default().is_visible());
        assert!(!Visibility::new(false).is_visible());
    }

    #[test]
    fn clones_share_state() {
        let page = Visibility::default();
        let timer_view = page.clone();
        page.set_visible(false);
        assert!(!timer_view.is_visible());
        page.set_visible(true);
        assert!(timer_view.is_visible());
    }

    #[test]
    fn subscribers_see_only_real_changes() {
        let page = Visibility::default();
        let mut rx = page.subscribe();
        page.set_visible(true);
        assert!(!rx.has_changed().unwrap());
        page.set_visible(false);
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());
    }
}
