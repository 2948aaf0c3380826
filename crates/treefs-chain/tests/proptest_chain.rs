//! Property-based tests for treefs-chain using proptest.

use std::collections::BTreeMap;

use proptest::prelude::*;
use treefs_chain::{
    flush, BrefType, Chain, ChainRef, Device, DeviceConfig, LookupFlags, ResolveFlags,
    TidAllocator, Trans,
};

fn make_root(name: &str) -> ChainRef {
    let dev = Device::new(DeviceConfig::named(name)).unwrap();
    Chain::new_root(Some(dev), BrefType::Volume, 4096)
}

fn collect_keys(parent: &ChainRef, flags: LookupFlags) -> Vec<u64> {
    let mut keys = Vec::new();
    let mut cache = 0;
    let mut key_next = 0;
    let mut cur = Chain::lookup(parent, &mut key_next, 0, u64::MAX, &mut cache, flags).unwrap();
    while let Some(chain) = cur {
        keys.push(chain.bref().key);
        cur = Chain::next(parent, chain, &mut key_next, 0, u64::MAX, &mut cache, flags)
            .unwrap();
    }
    keys
}

/// Map of key to payload, sized to fit a 4096-byte block table.
fn any_children() -> impl Strategy<Value = BTreeMap<u64, Vec<u8>>> {
    proptest::collection::btree_map(0u64..100_000, proptest::collection::vec(any::<u8>(), 1..64), 0..48)
}

proptest! {
    /// Iteration visits every live child exactly once in key order,
    /// regardless of creation order.
    #[test]
    fn test_iteration_is_ordered(children in any_children(), reverse in any::<bool>()) {
        let root = make_root("prop-iter");
        let tids = TidAllocator::default();
        let trans = Trans::begin(&tids);
        let mut keys: Vec<u64> = children.keys().copied().collect();
        if reverse {
            keys.reverse();
        }
        for key in &keys {
            Chain::create(&trans, &root, *key, 0, BrefType::Data, 8, 0).unwrap().unlock();
        }
        let expected: Vec<u64> = children.keys().copied().collect();
        prop_assert_eq!(collect_keys(&root, LookupFlags::NODATA), expected.clone());
        prop_assert_eq!(collect_keys(&root, LookupFlags::NOLOCK), expected);
    }

    /// A flushed tree reloaded from its device yields the same keys and payloads.
    #[test]
    fn test_flush_reload_preserves_children(children in any_children()) {
        let dev = Device::new(DeviceConfig::named("prop-reload")).unwrap();
        let root = Chain::new_root(Some(dev.clone()), BrefType::Volume, 4096);
        let tids = TidAllocator::default();
        let trans = Trans::begin(&tids);
        for (key, payload) in &children {
            let c = Chain::create(&trans, &root, *key, 0, BrefType::Data, payload.len(), 0).unwrap();
            c.with_data_mut(|d| d.copy_from_slice(payload)).unwrap();
            c.unlock();
        }
        flush(&Trans::begin(&tids), &root).unwrap();

        let reloaded = Chain::from_media(dev, root.bref());
        reloaded.lock(ResolveFlags::ALWAYS).unwrap();
        let mut cache = 0;
        let mut key_next = 0;
        let mut seen = BTreeMap::new();
        let mut cur = Chain::lookup(&reloaded, &mut key_next, 0, u64::MAX, &mut cache, LookupFlags::ALWAYS).unwrap();
        while let Some(chain) = cur {
            seen.insert(chain.bref().key, chain.with_data(|d| d.to_vec()).unwrap());
            cur = Chain::next(&reloaded, chain, &mut key_next, 0, u64::MAX, &mut cache, LookupFlags::ALWAYS).unwrap();
        }
        reloaded.unlock();
        prop_assert_eq!(seen, children);
    }

    /// Balanced lock/unlock sequences leave the chain unreferenced and unlocked.
    #[test]
    fn test_lock_unlock_balances_refs(depth in 1usize..16) {
        let root = make_root("prop-refs");
        for _ in 0..depth {
            root.lock(ResolveFlags::MAYBE).unwrap();
        }
        prop_assert_eq!(root.refs(), depth as u32);
        for _ in 0..depth {
            root.unlock();
        }
        prop_assert_eq!(root.refs(), 0);
        prop_assert!(!root.is_locked());
    }
}
