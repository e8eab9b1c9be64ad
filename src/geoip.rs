use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use anyhow::anyhow;
use compact_str::CompactString;
use maxminddb::geoip2::Country;
use maxminddb::Reader;
use parking_lot::RwLock;

/// Answers whether an address belongs to the region served directly.
pub trait RegionClassifier: Send + Sync {
    fn is_local(&self, ip: IpAddr) -> bool;
}

/// Country lookups against a MaxMind database, cached per address for the
/// lifetime of the process.
pub struct GeoIp {
    reader: Reader<Vec<u8>>,
    region: CompactString,
    cache: RwLock<HashMap<IpAddr, CompactString>>,
}

impl GeoIp {
    pub fn open(path: impl AsRef<Path>, region: &str) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let reader = Reader::open_readfile(path)
            .map_err(|e| anyhow!("failed to open GeoIP database {}: {e}", path.display()))?;
        Ok(GeoIp {
            reader,
            region: CompactString::from(region),
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// ISO country code of `ip`, if the database knows it.
    pub fn country(&self, ip: IpAddr) -> Option<CompactString> {
        if let Some(code) = self.cache.read().get(&ip) {
            return Some(code.clone());
        }
        let code = match self.reader.lookup::<Country>(ip) {
            Ok(c) => CompactString::from(c.country?.iso_code?),
            // not found, or a malformed record
            Err(_) => return None,
        };
        self.cache.write().insert(ip, code.clone());
        Some(code)
    }
}

impl RegionClassifier for GeoIp {
    fn is_local(&self, ip: IpAddr) -> bool {
        self.country(ip).map_or(false, |code| code == self.region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_database_is_an_error() {
        let err = GeoIp::open("/nonexistent/GeoLite2-City.mmdb", "CN")
            .err()
            .unwrap();
        assert!(err.to_string().contains("GeoLite2-City.mmdb"));
    }
}
