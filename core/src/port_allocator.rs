/// Allocates free ports to agents within a configured range.
///
/// There is no dedicated allocator table; availability is derived by asking
/// the `Store` which ports in range are currently claimed, the same
/// read-then-decide shape `lease_manager.rs` uses for lease acquisition
/// before the conditional `INSERT`/`UPDATE` that actually claims the slot.
/// The claim itself happens when the caller writes the chosen port onto the
/// agent row; the partial unique index on `agents.port` is the real
/// correctness backstop if two allocations race.
use crate::errors::{ControllerError, ControllerResult};
use crate::store::Store;

pub struct PortAllocator<'s> {
    store: &'s Store,
    port_min: u16,
    port_max: u16,
}

impl<'s> PortAllocator<'s> {
    pub fn new(store: &'s Store, port_min: u16, port_max: u16) -> Self {
        PortAllocator {
            store,
            port_min,
            port_max,
        }
    }

    /// Returns the lowest free port in range, or `ResourceExhausted` if the
    /// whole range is claimed.
    pub async fn allocate(&self) -> ControllerResult<u16> {
        let claimed = self.store.find_ports_in_range(self.port_min, self.port_max).await?;
        let claimed: std::collections::HashSet<u16> = claimed.into_iter().collect();

        (self.port_min..=self.port_max)
            .find(|p| !claimed.contains(p))
            .ok_or_else(|| {
                ControllerError::ResourceExhausted(format!(
                    "no free ports in [{}, {}]",
                    self.port_min, self.port_max
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Agent, AgentConfigDocument, AgentStatus};
    use chrono::Utc;
    use uuid::Uuid;

    async fn store_with_claimed_ports(ports: &[u16]) -> Store {
        let store = Store::connect_in_memory().await.unwrap();
        let owner = Uuid::new_v4();
        for (i, port) in ports.iter().enumerate() {
            let now = Utc::now();
            let agent = Agent {
                id: Uuid::new_v4(),
                name: format!("a{i}"),
                description: None,
                status: AgentStatus::Running,
                config: AgentConfigDocument {
                    model: Some("m".into()),
                    ..Default::default()
                },
                template_id: None,
                process_id: Some(100 + i as u32),
                port: Some(*port),
                last_heartbeat: None,
                error_message: None,
                restart_count: 0,
                created_by: owner,
                created_at: now,
                updated_at: now,
            };
            store.create_agent(&agent).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn allocates_lowest_free_port() {
        let store = store_with_claimed_ports(&[3001, 3002]).await;
        let allocator = PortAllocator::new(&store, 3001, 3010);
        assert_eq!(allocator.allocate().await.unwrap(), 3003);
    }

    #[tokio::test]
    async fn exhausted_range_errors() {
        let ports: Vec<u16> = (3001..=3003).collect();
        let store = store_with_claimed_ports(&ports).await;
        let allocator = PortAllocator::new(&store, 3001, 3003);
        assert!(matches!(
            allocator.allocate().await,
            Err(ControllerError::ResourceExhausted(_))
        ));
    }
}
