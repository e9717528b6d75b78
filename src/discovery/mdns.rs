//! mDNS service advertisement
//!
//! Advertises the satellite as an ESPHome device (`_esphomelib._tcp.local.`)
//! so the hub discovers it without manual configuration.
//!
//! TXT records:
//! - `version`: Satellite version
//! - `mac`: Device MAC address
//! - `platform`: Always `lark`
//! - `board`: Always `satellite`

use std::collections::HashMap;
use std::sync::Arc;

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tokio::sync::RwLock;

use crate::Result;

/// mDNS service type ESPHome hubs browse for
pub const SERVICE_TYPE: &str = "_esphomelib._tcp.local.";

/// mDNS advertiser for hub discovery
pub struct MdnsAdvertiser {
    /// mDNS daemon
    daemon: ServiceDaemon,

    /// Currently registered service (if any)
    registered_service: Arc<RwLock<Option<String>>>,
}

impl MdnsAdvertiser {
    /// Create a new mDNS advertiser
    ///
    /// # Errors
    ///
    /// Returns error if the mDNS daemon cannot be created
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| crate::Error::Config(format!("failed to create mDNS daemon: {e}")))?;

        Ok(Self {
            daemon,
            registered_service: Arc::new(RwLock::new(None)),
        })
    }

    /// Start advertising the satellite
    ///
    /// # Arguments
    ///
    /// * `name` - Device name (mDNS instance name)
    /// * `mac_address` - MAC address reported to the hub
    /// * `port` - Native API port
    ///
    /// # Errors
    ///
    /// Returns error if the service cannot be registered
    pub async fn start(&self, name: &str, mac_address: &str, port: u16) -> Result<()> {
        let hostname = hostname::get()
            .map_or_else(|_| "lark".to_string(), |h| h.to_string_lossy().to_string());

        let mut properties = HashMap::new();
        properties.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());
        properties.insert("mac".to_string(), mac_address.replace(':', ""));
        properties.insert("platform".to_string(), "lark".to_string());
        properties.insert("board".to_string(), "satellite".to_string());

        let service = ServiceInfo::new(
            SERVICE_TYPE,
            name,
            &format!("{hostname}.local."),
            "",
            port,
            properties,
        )
        .map_err(|e| crate::Error::Config(format!("failed to create service info: {e}")))?;

        let fullname = service.get_fullname().to_string();

        self.daemon
            .register(service)
            .map_err(|e| crate::Error::Config(format!("failed to register mDNS service: {e}")))?;

        {
            let mut registered = self.registered_service.write().await;
            *registered = Some(fullname);
        }

        tracing::info!(
            service_type = SERVICE_TYPE,
            instance = name,
            port = port,
            "mDNS service registered"
        );

        Ok(())
    }

    /// Stop advertising the satellite
    pub async fn stop(&self) {
        let fullname = {
            let mut registered = self.registered_service.write().await;
            registered.take()
        };

        if let Some(name) = fullname {
            if let Err(e) = self.daemon.unregister(&name) {
                tracing::warn!(error = %e, "failed to unregister mDNS service");
            } else {
                tracing::info!("mDNS service unregistered");
            }
        }
    }

    /// Check if currently advertising
    pub async fn is_advertising(&self) -> bool {
        self.registered_service.read().await.is_some()
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        // Try to unregister on drop (best effort, synchronous)
        if let Ok(guard) = self.registered_service.try_read() {
            if let Some(name) = guard.as_ref() {
                let _ = self.daemon.unregister(name);
            }
        }
        if let Err(e) = self.daemon.shutdown() {
            tracing::trace!(error = %e, "mDNS daemon shutdown error (expected on normal exit)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_format() {
        assert!(SERVICE_TYPE.ends_with(".local."));
        assert!(SERVICE_TYPE.starts_with('_'));
        assert!(SERVICE_TYPE.contains("._tcp."));
    }

    #[tokio::test]
    async fn test_advertiser_creation() {
        // Actual mDNS registration may fail in CI environments; only assert
        // the initial state when the daemon comes up
        if let Ok(advertiser) = MdnsAdvertiser::new() {
            assert!(!advertiser.is_advertising().await);
        }
    }
}
