use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::MappingError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingProtocol {
    Udp,
    Tcp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub public: u16,
    pub private: u16,
    pub protocol: MappingProtocol,
    pub description: String,
    #[serde(with = "ttl_secs")]
    pub ttl: Duration,
}

mod ttl_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(ttl.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// The gateway's port-forwarding capability (UPnP IGD, NAT-PMP, ...).
#[async_trait]
pub trait PortMapper: Send + Sync {
    async fn is_supported(&self) -> bool;
    async fn get_mappings(&self) -> Result<Vec<PortMapping>, MappingError>;
    async fn map(&self, mapping: &PortMapping) -> Result<(), MappingError>;
    async fn unmap(&self, mapping: &PortMapping) -> Result<(), MappingError>;
}

pub const MAPPING_DESCRIPTION: &str = "peerlink";
const MAPPING_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Tracks the mappings this process created so a full table can be freed
/// without touching anyone else's entries.
pub struct MappingPool {
    mapper: Arc<dyn PortMapper>,
    description: String,
    owned: Mutex<Vec<PortMapping>>,
}

impl MappingPool {
    pub fn new(mapper: Arc<dyn PortMapper>) -> Self {
        Self::with_description(mapper, MAPPING_DESCRIPTION)
    }

    pub fn with_description(mapper: Arc<dyn PortMapper>, description: impl Into<String>) -> Self {
        Self {
            mapper,
            description: description.into(),
            owned: Mutex::new(Vec::new()),
        }
    }

    pub fn owned(&self) -> Vec<PortMapping> {
        self.owned.lock().clone()
    }

    /// Forwards `public` on the gateway to local UDP `local`. A full table is
    /// answered by evicting this pool's own mappings and retrying once.
    pub async fn map_port(&self, local: u16, public: u16) -> Result<PortMapping, MappingError> {
        if !self.mapper.is_supported().await {
            return Err(MappingError::Unsupported);
        }
        let mapping = PortMapping {
            public,
            private: local,
            protocol: MappingProtocol::Udp,
            description: self.description.clone(),
            ttl: MAPPING_TTL,
        };
        if self.owned.lock().contains(&mapping) {
            return Ok(mapping);
        }
        match self.mapper.map(&mapping).await {
            Ok(()) => {}
            Err(MappingError::TableFull) => {
                warn!(
                    target = "peerlink::nat",
                    public, local, "mapping table full; evicting own mappings"
                );
                self.evict_own().await;
                self.mapper.map(&mapping).await?;
            }
            Err(err) => return Err(err),
        }
        info!(target = "peerlink::nat", public, local, "port mapped");
        self.owned.lock().push(mapping.clone());
        Ok(mapping)
    }

    async fn evict_own(&self) {
        let mut victims = std::mem::take(&mut *self.owned.lock());
        match self.mapper.get_mappings().await {
            Ok(existing) => {
                for mapping in existing {
                    if mapping.description == self.description && !victims.contains(&mapping) {
                        victims.push(mapping);
                    }
                }
            }
            Err(err) => debug!(target = "peerlink::nat", error = %err, "listing mappings failed"),
        }
        for mapping in victims {
            if let Err(err) = self.mapper.unmap(&mapping).await {
                debug!(
                    target = "peerlink::nat",
                    public = mapping.public,
                    error = %err,
                    "unmap failed"
                );
            }
        }
    }

    pub async fn unmap_all(&self) {
        let owned = std::mem::take(&mut *self.owned.lock());
        for mapping in owned {
            let _ = self.mapper.unmap(&mapping).await;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::TableMapper;
    use super::*;

    fn foreign(public: u16) -> PortMapping {
        PortMapping {
            public,
            private: public,
            protocol: MappingProtocol::Tcp,
            description: "someone else".into(),
            ttl: Duration::from_secs(60),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn table_full_evicts_only_own_mappings_then_retries() {
        let mapper = Arc::new(TableMapper::new(3));
        mapper.table.lock().push(foreign(80));
        let pool = MappingPool::new(mapper.clone());

        pool.map_port(35565, 40001).await.expect("first");
        pool.map_port(35565, 40002).await.expect("second");
        let third = pool.map_port(35565, 40003).await.expect("third after eviction");

        let table = mapper.table.lock().clone();
        assert!(table.contains(&foreign(80)));
        assert_eq!(table.len(), 2);
        assert_eq!(pool.owned(), vec![third]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn second_full_table_is_propagated() {
        let mapper = Arc::new(TableMapper::new(1));
        mapper.table.lock().push(foreign(80));
        let pool = MappingPool::new(mapper);
        assert_eq!(
            pool.map_port(35565, 40001).await,
            Err(MappingError::TableFull)
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn unsupported_gateway() {
        let mut mapper = TableMapper::new(4);
        mapper.supported = false;
        let pool = MappingPool::new(Arc::new(mapper));
        assert_eq!(
            pool.map_port(35565, 40001).await,
            Err(MappingError::Unsupported)
        );
    }

    #[test]
    fn mapping_serializes_ttl_in_seconds() {
        let json = serde_json::to_value(foreign(25565)).expect("json");
        assert_eq!(json["ttl"], 60);
        assert_eq!(json["protocol"], "tcp");
    }
}
