//! A latest-value cell between the node-label watcher and the applier
//! loop. Setting replaces any unread value (drop-oldest); getting blocks
//! until a value is present. Intermediate values may be lost, but the
//! newest value is always observed.

use std::sync::Mutex;

use tokio::sync::Notify;

pub struct SyncableValue<T> {
    value: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> SyncableValue<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub fn set(&self, value: T) {
        *self.value.lock().unwrap() = Some(value);
        self.notify.notify_one();
    }

    pub async fn get(&self) -> T {
        loop {
            if let Some(value) = self.value.lock().unwrap().take() {
                return value;
            }
            self.notify.notified().await;
        }
    }
}

impl<T> Default for SyncableValue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn newest_value_wins() {
        let cell = SyncableValue::new();
        cell.set("old");
        cell.set("new");
        assert_eq!(cell.get().await, "new");
    }

    #[tokio::test]
    async fn get_blocks_until_set() {
        let cell = Arc::new(SyncableValue::new());

        let setter = Arc::clone(&cell);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            setter.set(42);
        });

        let value = tokio::time::timeout(Duration::from_secs(5), cell.get())
            .await
            .unwrap();
        assert_eq!(value, 42);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn values_are_consumed_once() {
        let cell = Arc::new(SyncableValue::new());
        cell.set(1);
        assert_eq!(cell.get().await, 1);

        let pending = tokio::time::timeout(Duration::from_millis(20), cell.get()).await;
        assert!(pending.is_err());

        cell.set(2);
        assert_eq!(cell.get().await, 2);
    }
}
