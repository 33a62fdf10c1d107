//! Property-based tests for dependency ordering, names and the free list
//!
//! Uses proptest to check ordering and naming invariants across random inputs

use proptest::prelude::*;
use resbundle::{
    BundleError, BundleWriter, ChunkType, FreeList, ResourceName, WriterConfig,
};
use std::collections::HashMap;

/// Chunk types 0..n where each type may depend on lower-numbered types only
fn acyclic_types() -> impl Strategy<Value = Vec<(u32, Vec<u32>)>> {
    (1u32..12).prop_flat_map(|count| {
        prop::collection::vec(prop::collection::vec(any::<prop::sample::Index>(), 0..3), count as usize)
            .prop_map(move |deps| {
                deps.into_iter()
                    .enumerate()
                    .map(|(id, picks)| {
                        let id = id as u32;
                        let deps = if id == 0 {
                            Vec::new()
                        } else {
                            picks.iter().map(|pick| pick.index(id as usize) as u32).collect()
                        };
                        (id, deps)
                    })
                    .collect()
            })
    })
}

proptest! {
    #[test]
    fn prop_dependencies_precede_dependents(
        types in acyclic_types(),
        insertion in any::<prop::sample::Index>(),
        copies in 1usize..3,
    ) {
        let mut chunks: Vec<(u32, Vec<u32>)> = Vec::new();
        for _ in 0..copies {
            chunks.extend(types.iter().cloned());
        }
        let rotate = insertion.index(chunks.len());
        chunks.rotate_left(rotate);

        let mut writer = BundleWriter::new(WriterConfig::default());
        for (i, (id, deps)) in chunks.iter().enumerate() {
            let ty = deps.iter().fold(ChunkType::new(*id), |ty, dep| ty.depends_on(*dep));
            writer.add_raw_binary_chunk(&format!("c{}", i), ty, &[*id as u8]).unwrap();
        }

        let order = writer.dependency_order().unwrap();
        prop_assert_eq!(order.len(), chunks.len());

        let mut sorted = order.clone();
        sorted.sort_unstable();
        prop_assert_eq!(sorted, (0..chunks.len()).collect::<Vec<_>>());

        // Every chunk of a dependency type sits before every chunk that needs it
        let mut position = HashMap::new();
        for (at, &index) in order.iter().enumerate() {
            position.insert(index, at);
        }
        for (dependent, (_, deps)) in chunks.iter().enumerate() {
            for dep in deps {
                for (dependency, (id, _)) in chunks.iter().enumerate() {
                    if id == dep {
                        prop_assert!(position[&dependency] < position[&dependent]);
                    }
                }
            }
        }
    }

    #[test]
    fn prop_cycles_are_rejected(length in 2u32..6) {
        let mut writer = BundleWriter::new(WriterConfig::default());
        for id in 0..length {
            let ty = ChunkType::new(id).depends_on((id + 1) % length);
            writer.add_raw_binary_chunk(&format!("c{}", id), ty, &[0]).unwrap();
        }
        prop_assert!(matches!(
            writer.build_to_vec(0),
            Err(BundleError::DependencyCycle(_))
        ));
    }

    #[test]
    fn prop_name_parts_reassemble(
        storage in "[a-z]{1,8}",
        name in "[a-zA-Z0-9_/.]{1,24}",
        subobject in "[a-zA-Z0-9_]{0,12}",
    ) {
        let full = ResourceName::from_parts(&storage, &name, &subobject);
        prop_assert!(full.is_valid());
        prop_assert_eq!(full.storage(), storage.as_str());
        prop_assert_eq!(full.name(), name.as_str());
        prop_assert_eq!(full.subobject(), subobject.as_str());
        prop_assert_eq!(
            ResourceName::new(full.as_str().to_string()),
            full.clone()
        );
        prop_assert_eq!(full.with_subobject(""), ResourceName::from_parts(&storage, &name, ""));
    }

    #[test]
    fn prop_bare_names_use_default_storage(name in "[a-zA-Z0-9_/.]{1,24}") {
        let resolved = ResourceName::new(name.clone());
        prop_assert_eq!(resolved.storage(), "disk");
        prop_assert_eq!(resolved.name(), name.as_str());
        prop_assert_eq!(resolved.subobject(), "");
    }

    #[test]
    fn prop_free_list_keeps_values_and_bumps_generations(
        ops in prop::collection::vec(any::<Option<prop::sample::Index>>(), 1..200)
    ) {
        let mut list: FreeList<usize> = FreeList::new();
        let mut live: HashMap<u32, usize> = HashMap::new();
        for (step, op) in ops.into_iter().enumerate() {
            match op {
                Some(pick) if !live.is_empty() => {
                    let mut indices: Vec<u32> = live.keys().copied().collect();
                    indices.sort_unstable();
                    let index = indices[pick.index(indices.len())];
                    let generation = list.generation(index);
                    prop_assert_eq!(list.erase(index), live.remove(&index));
                    prop_assert!(!list.is_live(index));
                    prop_assert_ne!(list.generation(index), generation);
                }
                _ => {
                    let index = list.push(step).unwrap();
                    prop_assert!(!live.contains_key(&index));
                    live.insert(index, step);
                }
            }
            prop_assert_eq!(list.len(), live.len());
        }
        for (index, value) in &live {
            prop_assert_eq!(list.get(*index), Some(value));
        }
    }
}

#[test]
fn test_name_grammar_edge_cases() {
    assert!(!ResourceName::new("$thing").is_valid());
    assert!(!ResourceName::new("disk$").is_valid());
    assert!(ResourceName::new("null$anything").is_null());
    assert!(ResourceName::null().is_null());

    let link = ResourceName::new("|$|$mesh");
    assert!(link.is_current_link());
    let current = ResourceName::new("mem$level$other");
    assert_eq!(link.rebase(&current).unwrap().as_str(), "mem$level$mesh");
    assert!(!ResourceName::new("|$|$").is_current_link());
    assert!(ResourceName::parse("$").is_err());
}
