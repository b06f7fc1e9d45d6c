use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::error::Result;
use crate::types::Context;

type Resolver<D> = Box<dyn Fn(Context) -> Result<D> + Send + Sync>;

/// Resolves symbolic [`Context`] values to the concrete device type `D` a
/// native engine binds to, caching each successful resolution.
///
/// Each engine owns its own registry; there is no process-wide device table.
///
/// # Example
///
/// ```
/// use ember::engine::DeviceRegistry;
/// use ember::types::{Context, DeviceType};
/// use ember::EmberError;
///
/// let registry = DeviceRegistry::new(|ctx: Context| match ctx.device_type() {
///     DeviceType::Cpu => Ok(ctx.device_id()),
///     DeviceType::Gpu => Err(EmberError::Allocation { reason: "no gpu".into() }),
/// });
/// assert_eq!(registry.resolve(Context::cpu_at(2)).unwrap(), 2);
/// assert!(registry.resolve(Context::gpu(0)).is_err());
/// ```
pub struct DeviceRegistry<D> {
    devices: Mutex<HashMap<Context, D>>,
    resolver: Resolver<D>,
}

impl<D: Clone> DeviceRegistry<D> {
    pub fn new<F>(resolver: F) -> Self
    where
        F: Fn(Context) -> Result<D> + Send + Sync + 'static,
    {
        Self {
            devices: Mutex::new(HashMap::new()),
            resolver: Box::new(resolver),
        }
    }

    /// The device for `context`, resolving and caching it on first use.
    ///
    /// Failed resolutions are not cached.
    pub fn resolve(&self, context: Context) -> Result<D> {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(device) = devices.get(&context) {
            return Ok(device.clone());
        }
        let device = (self.resolver)(context)?;
        debug!(%context, "resolved device");
        devices.insert(context, device.clone());
        Ok(device)
    }

    /// Contexts resolved so far.
    pub fn contexts(&self) -> Vec<Context> {
        let devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        devices.keys().copied().collect()
    }
}

impl<D> fmt::Debug for DeviceRegistry<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resolved = self
            .devices
            .lock()
            .map(|devices| devices.len())
            .unwrap_or_default();
        f.debug_struct("DeviceRegistry")
            .field("resolved", &resolved)
            .finish()
    }
}
