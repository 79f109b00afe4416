use relaymesh_common::{normalize_country_code, GLOBAL_REGION};
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::warn;

/// Maps a tunnel's remote address to a region code at accept time
pub trait RegionResolver: Send + Sync {
    fn resolve(&self, ip: IpAddr) -> String;
}

/// Every node lands in the global pool
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalRegion;

impl RegionResolver for GlobalRegion {
    fn resolve(&self, _ip: IpAddr) -> String {
        GLOBAL_REGION.to_string()
    }
}

/// Region table loaded from configuration. Unknown addresses are global.
#[derive(Debug, Default, Clone)]
pub struct StaticRegionResolver {
    table: HashMap<IpAddr, String>,
}

impl StaticRegionResolver {
    pub fn from_config(entries: &HashMap<String, String>) -> Self {
        let mut table = HashMap::new();
        for (ip, code) in entries {
            let Ok(ip) = ip.parse::<IpAddr>() else {
                warn!("Ignoring region entry with invalid address {:?}", ip);
                continue;
            };
            match normalize_country_code(code) {
                Some(code) => {
                    table.insert(ip, code);
                }
                None => warn!("Ignoring unknown country code {:?} for {}", code, ip),
            }
        }
        Self { table }
    }
}

impl RegionResolver for StaticRegionResolver {
    fn resolve(&self, ip: IpAddr) -> String {
        self.table
            .get(&ip)
            .cloned()
            .unwrap_or_else(|| GLOBAL_REGION.to_string())
    }
}
