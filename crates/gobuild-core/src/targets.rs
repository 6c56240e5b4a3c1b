//! Supported build targets and their popularity ordering.
//!
//! The table is a `go tool dist list` snapshot minus targets that
//! cannot be cross-built from a plain linux/amd64 builder. The list
//! is re-sorted by descending use after every observation during
//! warmup and every 32nd observation afterwards, so UI listings show
//! popular targets first without churning on every hit.

use std::collections::HashMap;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub goos: &'static str,
    pub goarch: &'static str,
}

impl Target {
    pub fn osarch(&self) -> String {
        format!("{}/{}", self.goos, self.goarch)
    }
}

// No android or ios: both need external SDKs on the builder.
// darwin/386 is gone as of go1.15; darwin/arm64 cross-builds from
// linux/amd64 with cgo disabled.
const DEFAULT_TARGETS: &[Target] = &[
    Target { goos: "aix", goarch: "ppc64" },
    Target { goos: "darwin", goarch: "amd64" },
    Target { goos: "darwin", goarch: "arm64" },
    Target { goos: "dragonfly", goarch: "amd64" },
    Target { goos: "freebsd", goarch: "386" },
    Target { goos: "freebsd", goarch: "amd64" },
    Target { goos: "freebsd", goarch: "arm" },
    Target { goos: "freebsd", goarch: "arm64" },
    Target { goos: "illumos", goarch: "amd64" },
    Target { goos: "js", goarch: "wasm" },
    Target { goos: "linux", goarch: "386" },
    Target { goos: "linux", goarch: "amd64" },
    Target { goos: "linux", goarch: "arm" },
    Target { goos: "linux", goarch: "arm64" },
    Target { goos: "linux", goarch: "mips" },
    Target { goos: "linux", goarch: "mips64" },
    Target { goos: "linux", goarch: "mips64le" },
    Target { goos: "linux", goarch: "mipsle" },
    Target { goos: "linux", goarch: "ppc64" },
    Target { goos: "linux", goarch: "ppc64le" },
    Target { goos: "linux", goarch: "riscv64" },
    Target { goos: "linux", goarch: "s390x" },
    Target { goos: "netbsd", goarch: "386" },
    Target { goos: "netbsd", goarch: "amd64" },
    Target { goos: "netbsd", goarch: "arm" },
    Target { goos: "netbsd", goarch: "arm64" },
    Target { goos: "openbsd", goarch: "386" },
    Target { goos: "openbsd", goarch: "amd64" },
    Target { goos: "openbsd", goarch: "arm" },
    Target { goos: "openbsd", goarch: "arm64" },
    Target { goos: "plan9", goarch: "386" },
    Target { goos: "plan9", goarch: "amd64" },
    Target { goos: "plan9", goarch: "arm" },
    Target { goos: "solaris", goarch: "amd64" },
    Target { goos: "windows", goarch: "386" },
    Target { goos: "windows", goarch: "amd64" },
    Target { goos: "windows", goarch: "arm" },
];

/// How often the list is re-sorted once past warmup.
const SORT_INTERVAL: u64 = 32;

#[derive(Debug)]
struct TargetsState {
    use_counts: HashMap<String, u64>,
    total_use: u64,
    list: Vec<Target>,
}

#[derive(Debug)]
pub struct Targets {
    inner: Mutex<TargetsState>,
}

impl Default for Targets {
    fn default() -> Self {
        Self::new()
    }
}

impl Targets {
    pub fn new() -> Self {
        let use_counts = DEFAULT_TARGETS
            .iter()
            .map(|t| (t.osarch(), 0u64))
            .collect();
        Targets {
            inner: Mutex::new(TargetsState {
                use_counts,
                total_use: 0,
                list: DEFAULT_TARGETS.to_vec(),
            }),
        }
    }

    /// Current list, most popular first once observations accrue.
    pub fn list(&self) -> Vec<Target> {
        self.inner.lock().list.clone()
    }

    /// Whether `goos/goarch` is a buildable target. Also the
    /// validation gate for incoming requests.
    pub fn valid(&self, osarch: &str) -> bool {
        self.inner.lock().use_counts.contains_key(osarch)
    }

    /// Record one hit for `goos/goarch` and re-sort on schedule.
    pub fn increase(&self, osarch: &str) {
        let mut state = self.inner.lock();
        let Some(count) = state.use_counts.get_mut(osarch) else {
            return;
        };
        *count += 1;
        state.total_use += 1;
        if state.total_use <= SORT_INTERVAL || state.total_use % SORT_INTERVAL == 0 {
            let counts = state.use_counts.clone();
            state
                .list
                .sort_by(|a, b| counts[&b.osarch()].cmp(&counts[&a.osarch()]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_known_targets() {
        let targets = Targets::new();
        assert!(targets.valid("linux/amd64"));
        assert!(targets.valid("js/wasm"));
        assert!(!targets.valid("linux/armbe"));
        assert!(!targets.valid("android/arm64"));
    }

    #[test]
    fn popular_target_floats_to_front() {
        let targets = Targets::new();
        for _ in 0..3 {
            targets.increase("plan9/arm");
        }
        assert_eq!(targets.list()[0].osarch(), "plan9/arm");
    }

    #[test]
    fn unknown_target_does_not_count() {
        let targets = Targets::new();
        targets.increase("android/arm64");
        assert_eq!(targets.list(), DEFAULT_TARGETS.to_vec());
    }
}
