//! The fixed resource policy applied to every kata container.
//!
//! No cpu ulimit: it counts cpu-seconds across all cores, so a program keeping
//! two cores busy hits it after half the wall time. Run time is bounded by the
//! wall-clock deadline in [`crate::timeout`].

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ulimit {
    pub name: &'static str,
    pub limit: u64,
}

impl Ulimit {
    const fn new(name: &'static str, limit: u64) -> Self {
        Ulimit { name, limit }
    }

    /// Soft and hard limits are always equal.
    pub fn docker_arg(&self) -> String {
        format!("{}={}:{}", self.name, self.limit, self.limit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    pub ulimits: [Ulimit; 7],
    pub memory_bytes: u64,
    pub pids_limit: u32,
    pub network_disabled: bool,
    pub no_new_privileges: bool,
}

pub const RESOURCE_LIMITS: ResourceLimits = ResourceLimits {
    ulimits: [
        Ulimit::new("data", 4 * GB),
        Ulimit::new("core", 0),
        Ulimit::new("fsize", 16 * MB),
        Ulimit::new("locks", 128),
        Ulimit::new("nofile", 128),
        Ulimit::new("nproc", 128),
        Ulimit::new("stack", 8 * MB),
    ],
    memory_bytes: 384 * MB,
    pids_limit: 128,
    network_disabled: true,
    no_new_privileges: true,
};

impl ResourceLimits {
    pub fn standard() -> &'static ResourceLimits {
        &RESOURCE_LIMITS
    }

    pub fn ulimit(&self, name: &str) -> Option<u64> {
        self.ulimits.iter().find(|u| u.name == name).map(|u| u.limit)
    }

    /// `docker run` flags enforcing this policy.
    pub fn docker_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.ulimits.len() * 2 + 4);
        for u in &self.ulimits {
            args.push("--ulimit".to_string());
            args.push(u.docker_arg());
        }
        // Docker expects a human-ish unit; round up to MiB.
        let mib = self.memory_bytes.saturating_add(MB - 1) / MB;
        args.push(format!("--memory={mib}m"));
        if self.network_disabled {
            args.push("--net=none".to_string());
        }
        args.push(format!("--pids-limit={}", self.pids_limit));
        if self.no_new_privileges {
            args.push("--security-opt=no-new-privileges".to_string());
        }
        args
    }
}
