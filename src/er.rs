use crate::channel::Channel;
use crate::factory::Entry;
use crate::operation::{Operation, OperationKind};
use anyhow::{Context, Result};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

pub type OperationMap = HashMap<String, Arc<Operation>>;

/// Child-record ids written for parent invocation `parent_index`:
/// `parent_index * max_er_keys + 1` onwards, `max_er_keys` of them, or a
/// uniform `[1, max_er_keys]` of them when `random` is set.
pub fn child_id_window(
    parent_index: u64,
    max_er_keys: u32,
    random: bool,
    rng: &mut impl Rng,
) -> Range<u64> {
    let start = parent_index * max_er_keys as u64 + 1;
    let count = if random && max_er_keys > 0 {
        rng.random_range(1..=max_er_keys)
    } else {
        max_er_keys
    };
    start..start + count as u64
}

/// Builds the record for `id`, through the factory when the operation has
/// one, otherwise a zero-filled payload under `<keyPrefix><id>`.
pub fn synthesize(operation: &Operation, id: u64, parent_key: Option<&str>) -> Result<Entry> {
    match &operation.factory {
        Some(factory) => factory
            .create_entry(id, parent_key)
            .with_context(|| format!("creating entry {id} for {}", operation.name)),
        None => Ok(Entry {
            key: operation.key_for(id),
            value: vec![0u8; operation.settings.payload_size as usize],
        }),
    }
}

/// Per-worker random generators, one per operation, seeded from the
/// operation's `randomSeed` and the worker number.
pub struct Generators {
    thread_num: u32,
    rngs: HashMap<String, SmallRng>,
}

impl Generators {
    pub fn new(thread_num: u32) -> Self {
        Generators {
            thread_num,
            rngs: HashMap::new(),
        }
    }

    pub fn for_operation(&mut self, operation: &Operation) -> &mut SmallRng {
        let seed = operation
            .settings
            .random_seed
            .wrapping_add(self.thread_num.saturating_sub(1) as u64);
        if !self.rngs.contains_key(&operation.name) {
            self.rngs
                .insert(operation.name.clone(), SmallRng::seed_from_u64(seed));
        }
        self.rngs
            .get_mut(&operation.name)
            .unwrap_or_else(|| unreachable!("generator inserted above"))
    }
}

/// Synchronously writes the ER children of `parent_key`, depth first.
/// Every level of the chain takes its ids from the top-level invocation
/// `parent_index` and links to the top-level `parent_key`.
/// Returns the number of child records written.
pub fn write_children(
    channel: &mut dyn Channel,
    operations: &OperationMap,
    parent: &Operation,
    parent_key: &str,
    parent_index: u64,
    generators: &mut Generators,
) -> Result<u64> {
    let Some(factory) = parent.factory.as_ref().filter(|f| f.is_er()) else {
        return Ok(0);
    };
    let Some(child) = factory
        .er_operation_name()
        .and_then(|name| operations.get(name))
    else {
        return Ok(0);
    };

    let window = child_id_window(
        parent_index,
        factory.max_er_keys(),
        factory.is_er_max_random(),
        generators.for_operation(parent),
    );

    let mut written = 0;
    for child_id in window {
        match &child.settings.kind {
            OperationKind::Pause(duration) => std::thread::sleep(*duration),
            OperationKind::DataStructure { .. } => {
                let entry = synthesize(child, child_id, Some(parent_key))?;
                channel.write(child, &entry)?;
                written += 1;
                written +=
                    write_children(channel, operations, child, parent_key, parent_index, generators)?;
            }
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::RecordingChannel;
    use crate::config::Properties;
    use crate::factory::FactoryRegistry;
    use crate::operation::OperationRegistry;

    fn resolve_all(pairs: &[(&str, &str)], names: &[&str]) -> OperationMap {
        let props: Properties = pairs.iter().copied().collect();
        let mut reg = OperationRegistry::new(Arc::new(props), FactoryRegistry::with_builtins());
        names
            .iter()
            .map(|n| (n.to_string(), reg.resolve(n).unwrap().unwrap()))
            .collect()
    }

    #[test]
    fn fixed_window_follows_parent_index() {
        let mut rng = SmallRng::seed_from_u64(1);
        assert_eq!(child_id_window(5, 3, false, &mut rng), 16..19);
        assert_eq!(child_id_window(1, 4, false, &mut rng), 5..9);
    }

    #[test]
    fn random_window_stays_within_bounds() {
        let mut rng = SmallRng::seed_from_u64(7);
        for index in 1..200 {
            let w = child_id_window(index, 4, true, &mut rng);
            assert_eq!(w.start, index * 4 + 1);
            let len = w.end - w.start;
            assert!((1..=4).contains(&len), "len {len}");
        }
    }

    #[test]
    fn parent_index_five_writes_children_sixteen_to_eighteen() {
        let ops = resolve_all(
            &[
                ("emp.topic", "employees"),
                ("emp.factory.class", "employee"),
                ("emp.factory.er.operation", "terr"),
                ("emp.factory.er.maxKeys", "3"),
                ("terr.topic", "territories"),
                ("terr.factory.class", "employee-territory"),
            ],
            &["emp", "terr"],
        );
        let mut channel = RecordingChannel::default();
        let mut generators = Generators::new(1);
        let n = write_children(&mut channel, &ops, &ops["emp"], "e000005", 5, &mut generators)
            .unwrap();
        assert_eq!(n, 3);
        let keys: Vec<_> = channel.writes.iter().map(|(op, k)| (op.as_str(), k.as_str())).collect();
        assert_eq!(
            keys,
            vec![
                ("terr", "et000016"),
                ("terr", "et000017"),
                ("terr", "et000018")
            ]
        );
    }

    #[test]
    fn grandchildren_reuse_the_top_level_index() {
        let ops = resolve_all(
            &[
                ("a.factory.class", "blob"),
                ("a.factory.er.operation", "b"),
                ("a.factory.er.maxKeys", "2"),
                ("b.factory.class", "blob"),
                ("b.factory.key.prefix", "b"),
                ("b.factory.er.operation", "c"),
                ("b.factory.er.maxKeys", "1"),
                ("c.factory.class", "blob"),
                ("c.factory.key.prefix", "c"),
            ],
            &["a", "b", "c"],
        );
        let mut channel = RecordingChannel::default();
        let n = write_children(&mut channel, &ops, &ops["a"], "k1", 1, &mut Generators::new(1))
            .unwrap();
        assert_eq!(n, 4);
        let keys: Vec<_> = channel.writes.iter().map(|(_, k)| k.as_str()).collect();
        assert_eq!(keys, vec!["b3", "c2", "b4", "c2"]);
    }

    #[test]
    fn generator_continues_across_lookups() {
        let ops = resolve_all(&[("a.topic", "t"), ("a.randomSeed", "9")], &["a"]);
        let mut generators = Generators::new(3);
        let drawn: Vec<u32> = (0..4)
            .map(|_| generators.for_operation(&ops["a"]).random())
            .collect();
        let mut expected = SmallRng::seed_from_u64(11);
        let expected: Vec<u32> = (0..4).map(|_| expected.random()).collect();
        assert_eq!(drawn, expected);
    }

    #[test]
    fn non_er_parent_writes_nothing() {
        let ops = resolve_all(&[("a.topic", "t")], &["a"]);
        let mut channel = RecordingChannel::default();
        let n = write_children(&mut channel, &ops, &ops["a"], "k1", 1, &mut Generators::new(1))
            .unwrap();
        assert_eq!(n, 0);
        assert!(channel.writes.is_empty());
    }
}
