//! Depth-first flush of modified chains to their device.
//!
//! Each flushed node is written copy-on-write to a freshly allocated
//! location; its parent's block table is then re-encoded from the new child
//! references, so a flush of the root produces a fully consistent image.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::chain::{Chain, ChainFlags, ChainRef};
use crate::error::ChainResult;
use crate::trans::Trans;

/// Counters for one flush pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlushStats {
    /// Chains whose payload was written.
    pub chains_written: u64,
    /// Deleted children dropped from block tables.
    pub chains_deleted: u64,
    /// Total payload bytes written.
    pub bytes_written: u64,
}

/// Flushes `chain` and every modified descendant.
pub fn flush(trans: &Trans, chain: &ChainRef) -> ChainResult<FlushStats> {
    let mut stats = FlushStats::default();
    flush_chain(trans, chain, &mut stats)?;
    debug!(
        chain = chain.id(),
        sync_tid = trans.sync_tid,
        written = stats.chains_written,
        deleted = stats.chains_deleted,
        bytes = stats.bytes_written,
        "flush complete"
    );
    Ok(stats)
}

fn flush_chain(trans: &Trans, chain: &ChainRef, stats: &mut FlushStats) -> ChainResult<()> {
    let flags = chain.flags();
    if flags.contains(ChainFlags::DELETED)
        || !flags.intersects(ChainFlags::MODIFIED | ChainFlags::UPDATE)
    {
        return Ok(());
    }

    for child in chain.child_chains() {
        if !child.flags().contains(ChainFlags::DELETED) {
            flush_chain(trans, &child, stats)?;
        }
    }

    if chain.bref_type().has_block_table() {
        chain.resolve_data()?;
        stats.chains_deleted += Chain::sync_block_table(chain)?;
    }
    let written = chain.write_out(trans)?;
    if written > 0 {
        stats.chains_written += 1;
        stats.bytes_written += written;
    }
    trace!(chain = chain.id(), written, "chain flushed");
    Ok(())
}
