//! Broker-side segment creation and inventory

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::BrokerConfig;
use crate::error::{Result, VermeerError};
use crate::memory::{BackingType, RegionConfig, SharedMemoryRegion};
use crate::mempool::{SegmentLayout, TieredPool};
use crate::relative_ptr::{SegmentId, SegmentRegistry};

use super::port_pool::{PortPool, PortPoolLayout};

/// Segment id of the management segment
pub const MANAGEMENT_SEGMENT_ID: SegmentId = 1;

/// One advertised segment, as served during the handshake
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub id: SegmentId,
    pub name: String,
    pub size: usize,
    pub path: PathBuf,
}

/// Owns every shared segment of one broker instance.
///
/// Created once at startup from the static configuration: the management
/// segment (port records, condition variables) plus one data segment per
/// access group with its pools laid out back-to-back. Nothing grows or
/// shrinks afterwards.
pub struct SegmentManager {
    registry: Arc<SegmentRegistry>,
    /// Mappings kept alive for the broker's lifetime
    _regions: Vec<SharedMemoryRegion>,
    port_pool: PortPool,
    pools: Vec<(String, TieredPool)>,
    inventory: Vec<SegmentInfo>,
}

impl SegmentManager {
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(SegmentRegistry::new());
        let mut regions = Vec::new();
        let mut inventory = Vec::new();

        // Management segment first, always id 1
        let management_layout = PortPoolLayout::compute(
            config.max_publishers,
            config.max_subscribers,
            config.max_processes,
        )?;
        let management_name = "vermeer_mgmt".to_string();
        let management_region = Self::create_region(
            config,
            &management_name,
            management_layout.total_size,
        )?;
        registry.register(
            MANAGEMENT_SEGMENT_ID,
            management_region.base_ptr(),
            management_region.size(),
        )?;
        let port_pool = unsafe {
            PortPool::create_in(
                management_region.base_ptr(),
                MANAGEMENT_SEGMENT_ID,
                &management_layout,
                Arc::clone(&registry),
            )
        };
        inventory.push(SegmentInfo {
            id: MANAGEMENT_SEGMENT_ID,
            name: management_name,
            size: management_region.size(),
            path: management_region
                .file_path()
                .cloned()
                .unwrap_or_default(),
        });
        log::info!(
            "created management segment ({} bytes, {} publishers, {} subscribers)",
            management_region.size(),
            config.max_publishers,
            config.max_subscribers
        );
        regions.push(management_region);

        // One data segment per access group
        let mut pools = Vec::new();
        for (index, segment_config) in config.segments.iter().enumerate() {
            let id = MANAGEMENT_SEGMENT_ID + 1 + index as SegmentId;
            let layout = SegmentLayout::compute(&segment_config.pools)?;
            let name = format!("vermeer_{}", segment_config.access_group);
            let region = Self::create_region(config, &name, layout.total_size)?;
            registry.register(id, region.base_ptr(), region.size())?;
            let pool = unsafe {
                TieredPool::create_in(
                    region.base_ptr(),
                    id,
                    &segment_config.pools,
                    Arc::clone(&registry),
                )?
            };
            log::info!(
                "created data segment '{}' (id {}, {} bytes, {} pools)",
                name,
                id,
                region.size(),
                segment_config.pools.len()
            );
            inventory.push(SegmentInfo {
                id,
                name,
                size: region.size(),
                path: region.file_path().cloned().unwrap_or_default(),
            });
            pools.push((segment_config.access_group.clone(), pool));
            regions.push(region);
        }

        Ok(Self {
            registry,
            _regions: regions,
            port_pool,
            pools,
            inventory,
        })
    }

    fn create_region(config: &BrokerConfig, name: &str, size: usize) -> Result<SharedMemoryRegion> {
        std::fs::create_dir_all(&config.segment_dir)
            .map_err(|e| VermeerError::from_io(e, "Failed to create segment directory"))?;
        SharedMemoryRegion::create(RegionConfig {
            name: name.to_string(),
            size,
            backing_type: BackingType::FileBacked,
            file_path: Some(config.segment_dir.join(name)),
            permissions: 0o600,
        })
    }

    pub fn registry(&self) -> &Arc<SegmentRegistry> {
        &self.registry
    }

    pub fn port_pool(&self) -> &PortPool {
        &self.port_pool
    }

    /// Pool of the given access group
    pub fn pool_for_group(&self, access_group: &str) -> Option<&TieredPool> {
        self.pools
            .iter()
            .find(|(group, _)| group == access_group)
            .map(|(_, pool)| pool)
    }

    /// The first configured data pool; serves processes without a group
    pub fn default_pool(&self) -> &TieredPool {
        &self.pools[0].1
    }

    /// Segments advertised during the handshake
    pub fn inventory(&self) -> &[SegmentInfo] {
        &self.inventory
    }
}
