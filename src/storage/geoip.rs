//! GeoIP lookup (§6, §9): consumed as `lookup(ip) -> country code`; loading
//! the `.mmdb` file is the engine's job, the lookup contract is external.
//! `MaxMindGeoIp` mirrors the teacher's `protection/geoip.rs` loader almost
//! verbatim — same tolerant "file missing → lookups return None" behavior.

use std::net::IpAddr;
use std::path::Path;

use tracing::{info, warn};

/// The collaborator interface the access & filter gate (C6) consumes.
/// Kept as a trait so tests can supply a fixed country without a real
/// `.mmdb` file on disk.
pub trait GeoIp: Send + Sync {
    fn lookup_country(&self, ip: IpAddr) -> Option<String>;
}

#[derive(serde::Deserialize, Debug)]
struct GeoIpCountry {
    country: Option<CountryRecord>,
}

#[derive(serde::Deserialize, Debug)]
struct CountryRecord {
    iso_code: Option<String>,
}

pub struct MaxMindGeoIp {
    city_reader: Option<maxminddb::Reader<Vec<u8>>>,
}

impl MaxMindGeoIp {
    pub fn new(city_db: &str) -> Self {
        let city_reader = if Path::new(city_db).exists() {
            match maxminddb::Reader::open_readfile(city_db) {
                Ok(reader) => {
                    info!(path = city_db, "GeoIP city database loaded successfully");
                    Some(reader)
                }
                Err(e) => {
                    warn!(path = city_db, error = %e, "failed to load GeoIP city database");
                    None
                }
            }
        } else {
            warn!(path = city_db, "GeoIP city database file not found");
            None
        };

        Self { city_reader }
    }

    pub fn has_db(&self) -> bool {
        self.city_reader.is_some()
    }
}

impl GeoIp for MaxMindGeoIp {
    fn lookup_country(&self, ip: IpAddr) -> Option<String> {
        let reader = self.city_reader.as_ref()?;

        match reader.lookup::<GeoIpCountry>(ip) {
            Ok(result) => result
                .country
                .and_then(|c| c.iso_code)
                .map(|code| code.to_uppercase()),
            Err(e) => {
                if !matches!(e, maxminddb::MaxMindDBError::AddressNotFoundError(_)) {
                    warn!(ip = %ip, error = %e, "GeoIP country lookup error");
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedGeoIp(Option<String>);
    impl GeoIp for FixedGeoIp {
        fn lookup_country(&self, _ip: IpAddr) -> Option<String> {
            self.0.clone()
        }
    }

    #[test]
    fn missing_database_yields_no_lookups() {
        let geoip = MaxMindGeoIp::new("/nonexistent/path.mmdb");
        assert!(!geoip.has_db());
        assert_eq!(geoip.lookup_country("1.2.3.4".parse().unwrap()), None);
    }

    #[test]
    fn test_double_can_stand_in_for_the_trait() {
        let geoip: Box<dyn GeoIp> = Box::new(FixedGeoIp(Some("US".to_string())));
        assert_eq!(geoip.lookup_country("1.2.3.4".parse().unwrap()), Some("US".to_string()));
    }
}
