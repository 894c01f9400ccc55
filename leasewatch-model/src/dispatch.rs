use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    ids::{RecordId, TenantId},
    watch::{WatchKind, WatchRecord},
};

/// Payload handed to the downstream processing pipeline for every record the
/// fan-out dispatcher accepts. Everything after this hand-off belongs to the
/// downstream consumer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub tenant_id: TenantId,
    pub record_id: RecordId,
    pub kind: WatchKind,
    pub classification: String,
    pub discovered_at: DateTime<Utc>,
}

impl DispatchMessage {
    pub fn for_record(record: &WatchRecord, classification: String) -> Self {
        Self {
            tenant_id: record.tenant_id.clone(),
            record_id: record.record_id.clone(),
            kind: record.kind,
            classification,
            discovered_at: record.discovered_at,
        }
    }

    /// Stable id downstream consumers can use to drop duplicate deliveries.
    pub fn dedupe_id(&self) -> String {
        format!("{}:{}:{}", self.tenant_id, self.kind, self.record_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn wire_shape_uses_snake_case_fields() {
        let msg = DispatchMessage {
            tenant_id: TenantId::new("firm-a").unwrap(),
            record_id: RecordId::new("doc-9").unwrap(),
            kind: WatchKind::Document,
            classification: "radiograph".into(),
            discovered_at: Utc.with_ymd_and_hms(2026, 2, 3, 4, 5, 6).unwrap(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["tenant_id"], "firm-a");
        assert_eq!(value["record_id"], "doc-9");
        assert_eq!(value["kind"], "document");
        assert_eq!(value["classification"], "radiograph");
        assert_eq!(value["discovered_at"], "2026-02-03T04:05:06Z");
        assert_eq!(msg.dedupe_id(), "firm-a:document:doc-9");
    }
}
