//! Security policy for sandbox containers.
//!
//! Every container the pool creates gets the same hardened posture: no
//! network, all capabilities dropped, no privilege escalation, static
//! memory/CPU ceilings. GPU devices are attached only when the engine
//! reports an accelerator runtime; otherwise execution falls back to
//! CPU-only without failing.

use std::collections::HashMap;

use bollard::service::{DeviceRequest, HostConfig};

use crate::sandbox::pool::ContainerMode;

/// Label marking containers managed by this service. Used to recognize
/// our own persistent containers across process restarts.
pub(crate) const MANAGED_LABEL: &str = "codebox.managed";

/// Label recording whether a container is persistent or ephemeral.
pub(crate) const MODE_LABEL: &str = "codebox.mode";

const NVIDIA_DRIVER: &str = "nvidia";

/// Static resource ceilings, parsed once from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResourceLimits {
    pub memory_bytes: i64,
    pub nano_cpus: i64,
}

/// Container-creation constraints derived from the security policy.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Constraints {
    pub network_mode: String,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub device_requests: Option<Vec<DeviceRequest>>,
    pub labels: HashMap<String, String>,
}

/// Derives the creation constraints for a container.
///
/// Pure and deterministic: the same inputs always produce the same
/// constraints, and there is no failure mode. `gpu` must already reflect
/// the capability probe; passing `true` without an accelerator runtime
/// present would fail container creation, so the pool only sets it when
/// the probe succeeded.
pub(crate) fn derive_constraints(
    gpu: bool,
    persistent: bool,
    limits: ResourceLimits,
) -> Constraints {
    let mode = if persistent {
        ContainerMode::Persistent
    } else {
        ContainerMode::Ephemeral
    };

    let device_requests = gpu.then(|| {
        vec![DeviceRequest {
            driver: Some(NVIDIA_DRIVER.to_string()),
            // -1 requests all available GPUs
            count: Some(-1),
            capabilities: Some(vec![vec!["gpu".to_string()]]),
            ..Default::default()
        }]
    });

    Constraints {
        network_mode: "none".to_string(),
        cap_drop: vec!["ALL".to_string()],
        security_opt: vec!["no-new-privileges".to_string()],
        memory_bytes: limits.memory_bytes,
        nano_cpus: limits.nano_cpus,
        device_requests,
        labels: HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (MODE_LABEL.to_string(), mode.to_string()),
        ]),
    }
}

impl Constraints {
    /// Builds the engine-level host configuration from these constraints.
    pub(crate) fn host_config(&self) -> HostConfig {
        HostConfig {
            network_mode: Some(self.network_mode.clone()),
            cap_drop: Some(self.cap_drop.clone()),
            security_opt: Some(self.security_opt.clone()),
            memory: Some(self.memory_bytes),
            nano_cpus: Some(self.nano_cpus),
            device_requests: self.device_requests.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: ResourceLimits = ResourceLimits {
        memory_bytes: 256 * 1024 * 1024,
        nano_cpus: 1_000_000_000,
    };

    #[test]
    fn test_network_always_disabled() {
        for gpu in [false, true] {
            for persistent in [false, true] {
                let constraints = derive_constraints(gpu, persistent, LIMITS);
                assert_eq!(constraints.network_mode, "none");
                assert_eq!(constraints.cap_drop, vec!["ALL"]);
                assert_eq!(constraints.security_opt, vec!["no-new-privileges"]);
            }
        }
    }

    #[test]
    fn test_gpu_attaches_device_request() {
        let constraints = derive_constraints(true, true, LIMITS);
        let requests = constraints.device_requests.expect("gpu device request");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].driver.as_deref(), Some("nvidia"));
        assert_eq!(requests[0].count, Some(-1));
    }

    #[test]
    fn test_no_gpu_falls_back_to_cpu_only() {
        let constraints = derive_constraints(false, true, LIMITS);
        assert!(constraints.device_requests.is_none());
    }

    #[test]
    fn test_mode_label() {
        let persistent = derive_constraints(false, true, LIMITS);
        assert_eq!(
            persistent.labels.get(MODE_LABEL).map(String::as_str),
            Some("persistent")
        );
        assert_eq!(
            persistent.labels.get(MANAGED_LABEL).map(String::as_str),
            Some("true")
        );

        let ephemeral = derive_constraints(false, false, LIMITS);
        assert_eq!(
            ephemeral.labels.get(MODE_LABEL).map(String::as_str),
            Some("ephemeral")
        );
    }

    #[test]
    fn test_deterministic() {
        let a = derive_constraints(true, false, LIMITS);
        let b = derive_constraints(true, false, LIMITS);
        assert_eq!(a, b);
    }

    #[test]
    fn test_host_config_carries_limits() {
        let config = derive_constraints(false, false, LIMITS).host_config();
        assert_eq!(config.memory, Some(256 * 1024 * 1024));
        assert_eq!(config.nano_cpus, Some(1_000_000_000));
        assert_eq!(config.network_mode.as_deref(), Some("none"));
    }
}
