//! [`AuditLogService`]: an append-only log of device messages, queryable by
//! time range.

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::hub::events::DeviceMessage;
use crate::ports::PortError;

#[async_trait::async_trait]
pub trait AuditLogService: Send + Sync {
    async fn append(&self, message: DeviceMessage) -> Result<(), PortError>;

    async fn query(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<DeviceMessage>, PortError>;
}

/// In-memory append-only log, suitable for tests and short-lived processes.
#[derive(Default)]
pub struct InMemoryAuditLog {
    entries: Mutex<Vec<DeviceMessage>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl AuditLogService for InMemoryAuditLog {
    async fn append(&self, message: DeviceMessage) -> Result<(), PortError> {
        self.entries.lock().await.push(message);
        Ok(())
    }

    async fn query(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<DeviceMessage>, PortError> {
        let entries = self.entries.lock().await;
        Ok(entries.iter().filter(|m| m.time >= since && m.time <= until).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::events::DeviceMessageBody;
    use crate::naming::{Address, Name};

    #[tokio::test]
    async fn query_filters_by_time_range() {
        let log = InMemoryAuditLog::new();
        let addr = Address::new("hub", Name::single("dev"));
        let old = DeviceMessage::new(
            Utc::now() - chrono::Duration::hours(2),
            addr.clone(),
            DeviceMessageBody::DeviceAttached { device_name: Name::single("dev") },
        );
        let recent = DeviceMessage::new(
            Utc::now(),
            addr,
            DeviceMessageBody::DeviceDetached { device_name: Name::single("dev") },
        );
        log.append(old).await.unwrap();
        log.append(recent.clone()).await.unwrap();

        let results = log.query(Utc::now() - chrono::Duration::minutes(1), Utc::now() + chrono::Duration::minutes(1)).await.unwrap();
        assert_eq!(results.len(), 1);
    }
}
