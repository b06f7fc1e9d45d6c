use std::fmt;
use std::str::FromStr;

use crate::error::EmberError;

/// Environment variable consulted by [`Context::from_env`].
pub const DEFAULT_CONTEXT_ENV: &str = "EMBER_DEFAULT_CONTEXT";

/// Kind of compute device a [`Context`] points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceType {
    Cpu,
    Gpu,
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Gpu => "gpu",
        }
    }
}

/// Symbolic locator of a compute resource: device kind plus index.
///
/// Engines resolve a context to a concrete device through a
/// [`DeviceRegistry`](crate::engine::DeviceRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Context {
    device_type: DeviceType,
    device_id: usize,
}

impl Context {
    pub fn new(device_type: DeviceType, device_id: usize) -> Self {
        Self {
            device_type,
            device_id,
        }
    }

    /// The first CPU.
    pub fn cpu() -> Self {
        Self::cpu_at(0)
    }

    pub fn cpu_at(device_id: usize) -> Self {
        Self::new(DeviceType::Cpu, device_id)
    }

    pub fn gpu(device_id: usize) -> Self {
        Self::new(DeviceType::Gpu, device_id)
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }

    /// Reads the default context from `EMBER_DEFAULT_CONTEXT`, falling back
    /// to `cpu(0)` when the variable is unset.
    ///
    /// Meant for the outermost API edge only; the dispatch core never reads
    /// process-wide state.
    pub fn from_env() -> Result<Self, EmberError> {
        match std::env::var(DEFAULT_CONTEXT_ENV) {
            Ok(value) => Self::from_setting(Some(&value)),
            Err(std::env::VarError::NotPresent) => Self::from_setting(None),
            Err(std::env::VarError::NotUnicode(raw)) => Err(EmberError::parse(
                "context",
                raw.to_string_lossy(),
            )),
        }
    }

    /// An empty or absent setting means `cpu(0)`.
    fn from_setting(value: Option<&str>) -> Result<Self, EmberError> {
        match value.map(str::trim) {
            None | Some("") => Ok(Self::default()),
            Some(value) => value.parse(),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::cpu()
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.device_type.as_str(), self.device_id)
    }
}

impl FromStr for Context {
    type Err = EmberError;

    /// Accepts `cpu`, `gpu`, `cpu(1)`, `gpu(0)`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().to_ascii_lowercase();
        let (kind, id) = match trimmed.split_once('(') {
            Some((kind, rest)) => {
                let id = rest
                    .strip_suffix(')')
                    .and_then(|digits| digits.trim().parse::<usize>().ok())
                    .ok_or_else(|| EmberError::parse("context", s))?;
                (kind.trim().to_string(), id)
            }
            None => (trimmed, 0),
        };
        let device_type = match kind.as_str() {
            "cpu" => DeviceType::Cpu,
            "gpu" | "cuda" => DeviceType::Gpu,
            _ => return Err(EmberError::parse("context", s)),
        };
        Ok(Context::new(device_type, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_first_cpu() {
        assert_eq!(Context::default(), Context::cpu_at(0));
    }

    #[test]
    fn test_display_and_parse() {
        let ctx = Context::gpu(3);
        assert_eq!(ctx.to_string(), "gpu(3)");
        assert_eq!("gpu(3)".parse::<Context>().unwrap(), ctx);
        assert_eq!("cpu".parse::<Context>().unwrap(), Context::cpu());
        assert_eq!(" CPU( 2 ) ".parse::<Context>().unwrap(), Context::cpu_at(2));
    }

    #[test]
    fn test_env_setting() {
        assert_eq!(Context::from_setting(None).unwrap(), Context::cpu());
        assert_eq!(Context::from_setting(Some("  ")).unwrap(), Context::cpu());
        assert_eq!(Context::from_setting(Some("gpu(1)")).unwrap(), Context::gpu(1));
        assert!(matches!(
            Context::from_setting(Some("npu(0)")),
            Err(EmberError::Parse { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("tpu(0)".parse::<Context>().is_err());
        assert!("gpu(x)".parse::<Context>().is_err());
        assert!("gpu(1".parse::<Context>().is_err());
    }
}
