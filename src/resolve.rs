//! External address-resolution boundary.
//! Mapping a device ID and MAC to a current IP is the job of a discovery
//! helper outside this crate; the reconnection supervisor only consumes it
//! through this trait when the last known address stops answering.

use futures_util::future::BoxFuture;

/// Looks up the current address of a device whose IP may have changed.
pub trait IpResolver: Send + Sync {
    /// Resolve a device to a host address (IP or hostname), or `None` if
    /// the device cannot currently be located.
    fn resolve<'a>(
        &'a self,
        device_id: &'a str,
        mac: Option<&'a str>,
    ) -> BoxFuture<'a, Option<String>>;
}

/// Resolver that never finds anything; the default when no discovery
/// helper is wired in, leaving the configured host as the only address.
pub struct NullResolver;

impl IpResolver for NullResolver {
    fn resolve<'a>(&'a self, _: &'a str, _: Option<&'a str>) -> BoxFuture<'a, Option<String>> {
        Box::pin(async { None })
    }
}

/// Resolver backed by a fixed table; useful in tests and for deployments
/// where addresses are pinned out-of-band.
pub struct StaticResolver {
    entries: Vec<(String, String)>,
}

impl StaticResolver {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl IpResolver for StaticResolver {
    fn resolve<'a>(
        &'a self,
        device_id: &'a str,
        _mac: Option<&'a str>,
    ) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            self.entries
                .iter()
                .find(|(id, _)| id == device_id)
                .map(|(_, host)| host.clone())
        })
    }
}
