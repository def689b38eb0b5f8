use std::path::PathBuf;

pub const ENV_FLUSH_NODES: &str = "DEVSYNC_FLUSH_NODES";
pub const ENV_DEVICE: &str = "DEVSYNC_DEVICE";
pub const ENV_DUMP_GPU: &str = "DEVSYNC_DUMP_GPU";

/// How launches interact with the command stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// `launch` returns right after enqueue, only `wait` blocks
    #[default]
    Async,
    /// Synchronize the stream after every single-node launch. Used for
    /// deterministic profiling.
    FlushEachNode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub mode: ExecutionMode,
    /// Device ordinal to bind. `None` uses the first device.
    pub device_index: Option<usize>,
    /// Prefix for dumping device kernel sources when nodes are finalized
    pub dump_kernels: Option<PathBuf>,
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flush = lookup(ENV_FLUSH_NODES)
            .unwrap_or_default()
            .parse::<i32>()
            .map(|i| i == 1)
            .unwrap_or_default();
        Self {
            mode: if flush {
                ExecutionMode::FlushEachNode
            } else {
                ExecutionMode::Async
            },
            device_index: lookup(ENV_DEVICE).and_then(|s| s.trim().parse().ok()),
            dump_kernels: lookup(ENV_DUMP_GPU)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn with_device(mut self, index: usize) -> Self {
        self.device_index = Some(index);
        self
    }

    pub fn flush_each_node(&self) -> bool {
        self.mode == ExecutionMode::FlushEachNode
    }
}

#[cfg(test)]
mod tests {
    use rustc_hash::FxHashMap;

    use super::*;

    #[test]
    fn test_from_lookup() {
        let env: FxHashMap<&str, &str> = [
            (ENV_FLUSH_NODES, "1"),
            (ENV_DEVICE, " 2"),
            (ENV_DUMP_GPU, "/tmp/k"),
        ]
        .into_iter()
        .collect();
        let config = Config::from_lookup(|k| env.get(k).map(|s| s.to_string()));
        assert!(config.flush_each_node());
        assert_eq!(config.device_index, Some(2));
        assert_eq!(config.dump_kernels, Some(PathBuf::from("/tmp/k")));

        let config = Config::from_lookup(|k| (k == ENV_FLUSH_NODES).then(|| "yes".to_string()));
        assert_eq!(config, Config::default());
    }
}
