//! Asynchronous data loading for clusters.

use tracing::{debug, warn};
use treefs_chain::{ChainError, ChainRef};

use crate::cluster::{Cluster, ClusterRef};
use crate::error::{ClusterError, ClusterResult};

/// I/O control block handed to a [`Cluster::load_async`] callback.
#[derive(Debug)]
pub struct Iocb {
    /// The cluster being loaded.
    pub cluster: ClusterRef,
    /// Slot whose chain was loaded.
    pub slot: usize,
    /// The chain that was loaded, if the cluster had any.
    pub chain: Option<ChainRef>,
    /// Device offset of the requested extent (radix in the low bits).
    pub data_off: u64,
    /// Size of the requested extent.
    pub bytes: usize,
    /// True when the data was already resident and no I/O was issued.
    pub synchronous: bool,
    /// Load failure, if any.
    pub error: Option<ClusterError>,
}

impl Iocb {
    /// True when the data is available.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Runs `f` over the loaded payload.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> ClusterResult<R> {
        if let Some(e) = &self.error {
            return Err(ClusterError::LoadFailed {
                reason: e.to_string(),
            });
        }
        let chain = self.chain.as_ref().ok_or(ClusterError::NoFocus)?;
        Ok(chain.with_data(f)?)
    }
}

impl Cluster {
    /// Loads the data of one replica and hands the result to `callback`.
    ///
    /// The first slot whose data is already resident is used; otherwise
    /// slot 0 (or the first populated slot when slot 0 is a hole) is read
    /// from its device. The callback runs exactly once: inline when no I/O
    /// is needed, otherwise from the device's completion thread.
    pub fn load_async<F>(self: &ClusterRef, callback: F)
    where
        F: FnOnce(Iocb) + Send + 'static,
    {
        let picked = {
            let mut st = self.state.lock();
            let resident = st
                .array
                .iter()
                .position(|s| s.chain.as_ref().is_some_and(|c| c.is_resident()));
            let idx = resident.or_else(|| {
                if st.array.first().is_some_and(|s| s.chain.is_some()) {
                    Some(0)
                } else {
                    st.array.iter().position(|s| s.chain.is_some())
                }
            });
            let picked = idx.and_then(|i| st.array[i].chain.clone().map(|c| (i, c)));
            if picked.is_some() {
                if st.iocb_inflight {
                    warn!("cluster load: a load is already in flight");
                }
                st.iocb_inflight = true;
            }
            picked
        };

        let Some((slot, chain)) = picked else {
            callback(Iocb {
                cluster: ClusterRef::clone(self),
                slot: 0,
                chain: None,
                data_off: 0,
                bytes: 0,
                synchronous: true,
                error: Some(ClusterError::NoFocus),
            });
            return;
        };

        let bref = chain.bref();
        let synchronous = chain.is_resident();
        let cluster = ClusterRef::clone(self);
        debug!(slot, data_off = bref.data_off, synchronous, "cluster load");
        let io_chain = ChainRef::clone(&chain);
        io_chain.resolve_async(move |res: Result<(), ChainError>| {
            cluster.state.lock().iocb_inflight = false;
            let iocb = Iocb {
                cluster,
                slot,
                chain: Some(chain),
                data_off: bref.data_off,
                bytes: bref.bytes as usize,
                synchronous,
                error: res.err().map(ClusterError::from),
            };
            callback(iocb);
        });
    }

    /// True while a [`load_async`](Self::load_async) is waiting on I/O.
    pub fn load_in_flight(&self) -> bool {
        self.state.lock().iocb_inflight
    }
}
