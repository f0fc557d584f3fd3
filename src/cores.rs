//! Thread-to-core binding for the writer and hasher threads. Binding is only
//! available with the `cpu-binding` feature; without it the calls are no-ops
//! so the surrounding plumbing stays identical.

#[derive(Clone, Copy, Debug, PartialEq)]
/// `CoreIndex` is a simple wrapper type for indexes into the set of visible
/// cores. It should only ever be created with a value known to be less than
/// the number of visible cores.
pub struct CoreIndex(usize);

impl CoreIndex {
    pub fn new(idx: usize) -> Self {
        CoreIndex(idx)
    }
}

#[cfg(feature = "cpu-binding")]
pub use binding::{bind_core, Cleanup};

#[cfg(feature = "cpu-binding")]
mod binding {
    use std::sync::Mutex;

    use anyhow::{format_err, Result};
    use hwloc::{Bitmap, ObjectType, Topology, TopologyObject, CPUBIND_THREAD};
    use lazy_static::lazy_static;
    use log::{debug, warn};

    use super::CoreIndex;

    lazy_static! {
        pub static ref TOPOLOGY: Mutex<Topology> = Mutex::new(Topology::new());
    }

    pub type ThreadId = libc::pthread_t;

    /// Helper method to get the thread id through libc.
    fn get_thread_id() -> ThreadId {
        unsafe { libc::pthread_self() }
    }

    pub struct Cleanup {
        tid: ThreadId,
        prior_state: Option<Bitmap>,
    }

    impl Drop for Cleanup {
        fn drop(&mut self) {
            if let Some(prior) = self.prior_state.take() {
                let child_topo = &TOPOLOGY;
                let mut locked_topo = child_topo.lock().expect("poisoned lock");
                let _ = locked_topo.set_cpubind_for_thread(self.tid, prior, CPUBIND_THREAD);
            }
        }
    }

    pub fn bind_core(core_index: CoreIndex) -> Result<Cleanup> {
        let child_topo = &TOPOLOGY;
        let tid = get_thread_id();
        let mut locked_topo = child_topo.lock().expect("poisoned lock");
        let core = get_core_by_index(&locked_topo, core_index)
            .map_err(|err| format_err!("failed to get core at index {}: {:?}", core_index.0, err))?;

        let cpuset = core
            .allowed_cpuset()
            .ok_or_else(|| format_err!("no allowed cpuset for core at index {}", core_index.0))?;
        debug!("allowed cpuset: {:?}", cpuset);
        let mut bind_to = cpuset;

        // Get only one logical processor (in case the core is SMT/hyper-threaded).
        bind_to.singlify();

        // Thread binding before explicit set.
        let before = locked_topo.get_cpubind_for_thread(tid, CPUBIND_THREAD);

        debug!("binding to {:?}", bind_to);
        let result = locked_topo
            .set_cpubind_for_thread(tid, bind_to, CPUBIND_THREAD)
            .map_err(|err| format_err!("failed to bind CPU: {:?}", err));

        if result.is_err() {
            warn!("error in bind_core, {:?}", result);
        }

        Ok(Cleanup {
            tid,
            prior_state: before,
        })
    }

    fn get_core_by_index(topo: &Topology, index: CoreIndex) -> Result<&TopologyObject> {
        let idx = index.0;

        match topo.objects_with_type(&ObjectType::Core) {
            Ok(all_cores) if idx < all_cores.len() => Ok(all_cores[idx]),
            Ok(all_cores) => Err(format_err!(
                "idx ({}) out of range for {} cores",
                idx,
                all_cores.len()
            )),
            _e => Err(format_err!("failed to get core by index {}", idx)),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        #[cfg(feature = "isolated-testing")]
        // This test should not be run while other tests are running, as
        // the core we bind may otherwise be busy and cause a failure.
        fn test_bind_core() {
            fil_logger::maybe_init();
            let cleanup = bind_core(CoreIndex::new(0));
            assert!(cleanup.is_ok());
        }
    }
}

#[cfg(not(feature = "cpu-binding"))]
pub use noop::{bind_core, Cleanup};

#[cfg(not(feature = "cpu-binding"))]
mod noop {
    use anyhow::Result;
    use log::debug;

    use super::CoreIndex;

    pub struct Cleanup;

    pub fn bind_core(core_index: CoreIndex) -> Result<Cleanup> {
        debug!("cpu-binding disabled, not binding {:?}", core_index);
        Ok(Cleanup)
    }
}
