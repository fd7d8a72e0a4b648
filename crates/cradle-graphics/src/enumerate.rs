//! Background enumeration of the provider's driver stack.
//!
//! Enumeration is pure filesystem reading, so it can run while the rest
//! of setup (runtime copy, lock handling) proceeds. The pool is bounded:
//! one task per architecture plus one for architecture-independent kinds,
//! never a general thread pool. Results land in a [`SystemInfoCache`]
//! that the sequential classification phase reads after joining each
//! task by its handle.

use crate::arch::Architecture;
use crate::listers::{list_json_drivers, list_module_drivers, DriverInstance};
use crate::manifest::DriverKind;
use cradle_sysroot::Provider;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, trace};

const JSON_KINDS: &[DriverKind] = &[
    DriverKind::VulkanIcd,
    DriverKind::VulkanExplicitLayer,
    DriverKind::VulkanImplicitLayer,
    DriverKind::EglIcd,
    DriverKind::EglExternalPlatform,
    DriverKind::OpenXr,
];

const MODULE_KINDS: &[DriverKind] = &[DriverKind::Dri, DriverKind::VaApi, DriverKind::Vdpau];

/// Memoized driver listings for one provider. Safe to share across the
/// enumeration tasks; each `(kind, arch)` combination is listed at most
/// once per process.
pub struct SystemInfoCache {
    provider: Provider,
    entries: Mutex<HashMap<(DriverKind, Option<Architecture>), Arc<Vec<DriverInstance>>>>,
}

impl SystemInfoCache {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// The drivers of `kind`, listing them on first use. JSON-manifest
    /// kinds are architecture-neutral and must be asked for with
    /// `arch = None`; module kinds need the architecture.
    pub fn drivers(
        &self,
        kind: DriverKind,
        arch: Option<Architecture>,
    ) -> Arc<Vec<DriverInstance>> {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            // A lister panicking in another task poisons the mutex; the
            // listings already stored are still valid.
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(cached) = entries.get(&(kind, arch)) {
            trace!(?kind, ?arch, "driver listing served from cache");
            return Arc::clone(cached);
        }
        let listed = Arc::new(match arch {
            Some(arch) => list_module_drivers(&self.provider, arch, kind),
            None => list_json_drivers(&self.provider, kind),
        });
        entries.insert((kind, arch), Arc::clone(&listed));
        listed
    }

    /// Whether a listing is already cached, without computing it.
    pub fn is_cached(&self, kind: DriverKind, arch: Option<Architecture>) -> bool {
        match self.entries.lock() {
            Ok(guard) => guard.contains_key(&(kind, arch)),
            Err(poisoned) => poisoned.into_inner().contains_key(&(kind, arch)),
        }
    }
}

/// One unit of background work: warm the cache for either one
/// architecture's module drivers or for the architecture-independent
/// JSON kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerationJob {
    PerArchitecture(Architecture),
    ArchIndependent,
}

impl EnumerationJob {
    fn run(self, cache: &SystemInfoCache, cancel: &AtomicBool) {
        match self {
            Self::PerArchitecture(arch) => {
                for &kind in MODULE_KINDS {
                    if cancel.load(Ordering::Relaxed) {
                        debug!(tuple = arch.tuple(), "enumeration cancelled");
                        return;
                    }
                    cache.drivers(kind, Some(arch));
                }
            }
            Self::ArchIndependent => {
                for &kind in JSON_KINDS {
                    if cancel.load(Ordering::Relaxed) {
                        debug!("architecture-independent enumeration cancelled");
                        return;
                    }
                    cache.drivers(kind, None);
                }
            }
        }
    }
}

enum Task {
    Running(JoinHandle<()>),
    /// Single-threaded mode: the job runs when joined, preserving the
    /// start-then-join contract without spawning.
    Deferred(EnumerationJob),
    Joined,
}

/// Handles for the enumeration pool. Tasks are joined by index, exactly
/// once each; joining twice or out of range is a programming error and
/// panics.
pub struct EnumerationTasks {
    cache: Arc<SystemInfoCache>,
    cancel: Arc<AtomicBool>,
    tasks: Vec<Task>,
}

impl EnumerationTasks {
    /// Starts one task per job. With `single_thread` set, nothing is
    /// spawned and each job runs inline at its join point instead.
    pub fn start(cache: Arc<SystemInfoCache>, jobs: &[EnumerationJob], single_thread: bool) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let tasks = jobs
            .iter()
            .map(|&job| {
                if single_thread {
                    Task::Deferred(job)
                } else {
                    let cache = Arc::clone(&cache);
                    let cancel = Arc::clone(&cancel);
                    Task::Running(std::thread::spawn(move || job.run(&cache, &cancel)))
                }
            })
            .collect();
        Self {
            cache,
            cancel,
            tasks,
        }
    }

    #[inline]
    pub fn cache(&self) -> &SystemInfoCache {
        &self.cache
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Asks every still-running task to stop early. The tasks must still
    /// be joined afterwards.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Waits for task `index`. Panics if the index is out of range, if
    /// the task was already joined, or if the task itself panicked.
    pub fn join(&mut self, index: usize) {
        let slot = self
            .tasks
            .get_mut(index)
            .unwrap_or_else(|| panic!("no enumeration task {index}"));
        match std::mem::replace(slot, Task::Joined) {
            Task::Running(handle) => {
                if let Err(payload) = handle.join() {
                    std::panic::resume_unwind(payload);
                }
            }
            Task::Deferred(job) => job.run(&self.cache, &self.cancel),
            Task::Joined => panic!("enumeration task {index} joined twice"),
        }
    }

    /// Joins every task that has not been joined yet, in order.
    pub fn join_all(&mut self) {
        for index in 0..self.tasks.len() {
            if !matches!(self.tasks[index], Task::Joined) {
                self.join(index);
            }
        }
    }
}

impl Drop for EnumerationTasks {
    /// Background work is never abandoned: anything still running is
    /// cancelled and waited for, even on an error path.
    fn drop(&mut self) {
        self.request_cancel();
        for slot in &mut self.tasks {
            if let Task::Running(handle) = std::mem::replace(slot, Task::Joined) {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cradle_sysroot::Sysroot;
    use std::path::Path;

    fn provider_with_drivers() -> (tempfile::TempDir, Provider) {
        let dir = tempfile::tempdir().unwrap();
        let write = |rel: &str, content: &[u8]| {
            let path = dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        };
        write(
            "etc/vulkan/icd.d/radeon.json",
            br#"{"ICD": {"library_path": "/usr/lib/libvulkan_radeon.so"}}"#,
        );
        write("usr/lib/x86_64-linux-gnu/dri/iris_dri.so", b"");
        let provider = Provider::new(Sysroot::open(dir.path()).unwrap(), "/run/host", "/run/gfx");
        (dir, provider)
    }

    #[test]
    fn cache_lists_once() {
        let (dir, provider) = provider_with_drivers();
        let cache = SystemInfoCache::new(provider);

        let first = cache.drivers(DriverKind::VulkanIcd, None);
        assert_eq!(first.len(), 1);

        // A manifest appearing later is not picked up; the listing is
        // memoized for the whole invocation.
        std::fs::write(
            dir.path().join("etc/vulkan/icd.d/late.json"),
            br#"{"ICD": {"library_path": "liblate.so"}}"#,
        )
        .unwrap();
        let second = cache.drivers(DriverKind::VulkanIcd, None);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn threaded_tasks_warm_the_cache() {
        let (_dir, provider) = provider_with_drivers();
        let cache = Arc::new(SystemInfoCache::new(provider));
        let mut tasks = EnumerationTasks::start(
            Arc::clone(&cache),
            &[
                EnumerationJob::ArchIndependent,
                EnumerationJob::PerArchitecture(Architecture::X86_64),
            ],
            false,
        );
        assert_eq!(tasks.len(), 2);
        tasks.join(0);
        tasks.join(1);

        assert!(cache.is_cached(DriverKind::VulkanIcd, None));
        assert!(cache.is_cached(DriverKind::Dri, Some(Architecture::X86_64)));
        assert_eq!(
            cache
                .drivers(DriverKind::Dri, Some(Architecture::X86_64))
                .len(),
            1
        );
        assert_eq!(
            cache.drivers(DriverKind::Dri, Some(Architecture::X86_64))[0]
                .provider_path(),
            Path::new("/usr/lib/x86_64-linux-gnu/dri/iris_dri.so")
        );
    }

    #[test]
    fn single_thread_mode_runs_at_join_time() {
        let (_dir, provider) = provider_with_drivers();
        let cache = Arc::new(SystemInfoCache::new(provider));
        let mut tasks = EnumerationTasks::start(
            Arc::clone(&cache),
            &[EnumerationJob::ArchIndependent],
            true,
        );

        assert!(!cache.is_cached(DriverKind::VulkanIcd, None));
        tasks.join(0);
        assert!(cache.is_cached(DriverKind::VulkanIcd, None));
    }

    #[test]
    #[should_panic(expected = "joined twice")]
    fn double_join_panics() {
        let (_dir, provider) = provider_with_drivers();
        let cache = Arc::new(SystemInfoCache::new(provider));
        let mut tasks =
            EnumerationTasks::start(cache, &[EnumerationJob::ArchIndependent], true);
        tasks.join(0);
        tasks.join(0);
    }

    #[test]
    fn cancelled_deferred_job_does_no_work() {
        let (_dir, provider) = provider_with_drivers();
        let cache = Arc::new(SystemInfoCache::new(provider));
        let mut tasks = EnumerationTasks::start(
            Arc::clone(&cache),
            &[EnumerationJob::ArchIndependent],
            true,
        );
        tasks.request_cancel();
        tasks.join(0);
        assert!(!cache.is_cached(DriverKind::VulkanIcd, None));
    }

    #[test]
    fn join_all_joins_the_remainder() {
        let (_dir, provider) = provider_with_drivers();
        let cache = Arc::new(SystemInfoCache::new(provider));
        let mut tasks = EnumerationTasks::start(
            Arc::clone(&cache),
            &[
                EnumerationJob::ArchIndependent,
                EnumerationJob::PerArchitecture(Architecture::I386),
            ],
            false,
        );
        tasks.join(1);
        tasks.join_all();
        assert!(cache.is_cached(DriverKind::VulkanIcd, None));
        assert!(cache.is_cached(DriverKind::Vdpau, Some(Architecture::I386)));
    }
}
