use crate::config::Properties;
use crate::error::ConfigError;
use crate::factory::{DataObjectFactory, FactoryRegistry};
use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_RESOURCE: &str = "map1";
pub const DEFAULT_PAYLOAD_SIZE: u32 = 1024;
pub const DEFAULT_BATCH_SIZE: u32 = 100;
pub const DEFAULT_KEY_PREFIX: &str = "k";
pub const DEFAULT_START_NUM: u64 = 1;
pub const DEFAULT_TOTAL_ENTRY_COUNT: u32 = 10_000;
pub const DEFAULT_RANDOM_SEED: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestCase {
    Read,
    ReadBatch,
    Write,
    WriteBatch,
}

impl TestCase {
    /// Case-insensitive; `poll`/`send` are accepted as aliases.
    /// Anything unrecognised is a plain write.
    pub fn parse(name: &str) -> TestCase {
        match name.trim().to_ascii_lowercase().as_str() {
            "read" | "poll" => TestCase::Read,
            "readbatch" | "pollbatch" => TestCase::ReadBatch,
            "writebatch" | "sendbatch" => TestCase::WriteBatch,
            _ => TestCase::Write,
        }
    }
}

impl Display for TestCase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TestCase::Read => "read",
            TestCase::ReadBatch => "readBatch",
            TestCase::Write => "write",
            TestCase::WriteBatch => "writeBatch",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Lz4,
    Snappy,
    Zstd,
}

impl Compression {
    /// Unknown algorithms silently become `None`.
    pub fn parse(name: &str) -> Compression {
        match name.trim() {
            "gzip" => Compression::Gzip,
            "lz4" => Compression::Lz4,
            "snappy" => Compression::Snappy,
            "zstd" => Compression::Zstd,
            _ => Compression::None,
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Lz4 => "lz4",
            Compression::Snappy => "snappy",
            Compression::Zstd => "zstd",
        })
    }
}

/// Producer/consumer knobs handed to the store when handles are created.
/// Unset values leave the store's own defaults in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportTuning {
    pub batch_size: Option<u32>,
    pub linger_ms: Option<u32>,
    pub fetch_size: Option<u32>,
    pub fetch_ms: Option<u32>,
    pub compression: Compression,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    DataStructure { resource: String, test_case: TestCase },
    Pause(Duration),
}

/// Every resolved field of an operation except its name and factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSettings {
    pub kind: OperationKind,
    pub total_entry_count: u32,
    pub payload_size: u32,
    pub batch_size: u32,
    pub transport: TransportTuning,
    pub key_prefix: String,
    pub start_num: u64,
    pub random_seed: u64,
    pub factory_class: Option<String>,
}

/// A fully resolved, immutable operation.
#[derive(Debug, Clone)]
pub struct Operation {
    pub name: String,
    pub settings: OperationSettings,
    pub factory: Option<Arc<dyn DataObjectFactory>>,
}

impl Operation {
    pub fn resource(&self) -> Option<&str> {
        match &self.settings.kind {
            OperationKind::DataStructure { resource, .. } => Some(resource),
            OperationKind::Pause(_) => None,
        }
    }

    /// Where database sessions store this operation's records: the
    /// factory's entity name, else the resource.
    pub fn table(&self) -> Option<&str> {
        match (&self.settings.kind, &self.factory) {
            (OperationKind::Pause(_), _) => None,
            (_, Some(factory)) => Some(factory.entity_name()),
            (OperationKind::DataStructure { resource, .. }, None) => Some(resource),
        }
    }

    pub fn test_case(&self) -> Option<TestCase> {
        match &self.settings.kind {
            OperationKind::DataStructure { test_case, .. } => Some(*test_case),
            OperationKind::Pause(_) => None,
        }
    }

    pub fn er_operation_name(&self) -> Option<&str> {
        self.factory
            .as_ref()
            .filter(|f| f.is_er())
            .and_then(|f| f.er_operation_name())
    }

    /// Key for id `id`, via the factory when one is bound.
    pub fn key_for(&self, id: u64) -> String {
        match &self.factory {
            Some(factory) => factory.get_key(id),
            None => format!("{}{}", self.settings.key_prefix, id),
        }
    }
}

#[derive(Debug, Clone)]
enum DraftKind {
    Topic(String),
    Pause(Duration),
}

/// Fields as configured locally for one operation; `None` means unset.
#[derive(Debug, Clone, Default)]
struct OperationDraft {
    kind: Option<DraftKind>,
    reference: Option<String>,
    test_case: Option<TestCase>,
    payload_size: Option<u32>,
    key_prefix: Option<String>,
    start_num: Option<u64>,
    total_entry_count: Option<u32>,
    batch_size: Option<u32>,
    kafka_batch_size: Option<u32>,
    kafka_linger_ms: Option<u32>,
    kafka_fetch_size: Option<u32>,
    kafka_fetch_ms: Option<u32>,
    compression: Option<Compression>,
    random_seed: Option<u64>,
    factory_class: Option<String>,
}

enum Parsed {
    Draft(Box<OperationDraft>),
    NoOp,
}

fn parse_draft(props: &Properties, name: &str) -> Result<Parsed, ConfigError> {
    let key = |field: &str| format!("{name}.{field}");
    let mut draft = OperationDraft::default();

    if let Some(topic) = props.get(&key("topic")) {
        draft.kind = Some(DraftKind::Topic(topic.trim().to_owned()));
    } else if let Some(sleep) = props.get(&key("sleep")) {
        let ms: i64 = sleep.trim().parse().map_err(|_| ConfigError::InvalidPause {
            operation: name.to_owned(),
            value: sleep.to_owned(),
        })?;
        if ms <= 0 {
            return Ok(Parsed::NoOp);
        }
        draft.kind = Some(DraftKind::Pause(Duration::from_millis(ms as u64)));
        // Pauses carry no target and ignore the remaining fields.
        return Ok(Parsed::Draft(Box::new(draft)));
    }

    draft.reference = props.get(&key("ref")).map(|r| r.trim().to_owned());
    draft.test_case = props.get(&key("testCase")).map(TestCase::parse);
    draft.payload_size = props.get_parsed(&key("payloadSize"))?;
    draft.key_prefix = props.get(&key("key.prefix")).map(str::to_owned);
    draft.start_num = props.get_parsed(&key("key.startNum"))?;
    draft.total_entry_count = props.get_parsed(&key("totalEntryCount"))?;
    draft.batch_size = props.get_parsed(&key("batchSize"))?;
    draft.kafka_batch_size = props.get_parsed(&key("kafka.batchSize"))?;
    draft.kafka_linger_ms = props.get_parsed(&key("kafka.lingerMs"))?;
    draft.kafka_fetch_size = props.get_parsed(&key("kafka.fetchSize"))?;
    draft.kafka_fetch_ms = props.get_parsed(&key("kafka.fetchMs"))?;
    draft.compression = props.get(&key("kafka.compression")).map(Compression::parse);
    draft.random_seed = props.get_parsed(&key("randomSeed"))?;
    draft.factory_class = props.get(&key("factory.class")).map(|c| c.trim().to_owned());
    Ok(Parsed::Draft(Box::new(draft)))
}

fn positive<T: Into<i64> + Copy>(operation: &str, field: &'static str, value: T) -> Result<T, ConfigError> {
    if value.into() <= 0 {
        Err(ConfigError::NonPositive {
            operation: operation.to_owned(),
            field,
            value: value.into(),
        })
    } else {
        Ok(value)
    }
}

/// Resolves and caches named operations from the flat configuration.
pub struct OperationRegistry {
    props: Arc<Properties>,
    factories: FactoryRegistry,
    resolved: HashMap<String, Option<Arc<Operation>>>,
    in_progress: HashSet<String>,
}

impl OperationRegistry {
    pub fn new(props: Arc<Properties>, factories: FactoryRegistry) -> Self {
        OperationRegistry {
            props,
            factories,
            resolved: HashMap::new(),
            in_progress: HashSet::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Operation>> {
        self.resolved.get(name).and_then(Option::as_ref)
    }

    /// Resolves `name`, returning the cached instance on repeat calls.
    /// `Ok(None)` means the operation is a non-positive pause and should be
    /// dropped by its caller.
    pub fn resolve(&mut self, name: &str) -> Result<Option<Arc<Operation>>, ConfigError> {
        if let Some(cached) = self.resolved.get(name) {
            return Ok(cached.clone());
        }
        if !self.in_progress.insert(name.to_owned()) {
            return Err(ConfigError::ReferenceCycle(name.to_owned()));
        }
        let result = self.resolve_uncached(name);
        self.in_progress.remove(name);
        let resolved = result?;
        self.resolved.insert(name.to_owned(), resolved.clone());
        Ok(resolved)
    }

    fn resolve_uncached(&mut self, name: &str) -> Result<Option<Arc<Operation>>, ConfigError> {
        let draft = match parse_draft(&self.props, name)? {
            Parsed::NoOp => return Ok(None),
            Parsed::Draft(draft) => *draft,
        };

        let parent = match &draft.reference {
            Some(reference) => {
                if !self.props.has_prefix(&format!("{reference}.")) {
                    return Err(ConfigError::UnknownOperation {
                        name: reference.clone(),
                        referrer: name.to_owned(),
                    });
                }
                match self.resolve(reference)? {
                    Some(op) => Some(op),
                    // Inheriting the kind of a dropped pause drops this one too.
                    None if draft.kind.is_none() => return Ok(None),
                    None => None,
                }
            }
            None => None,
        };

        let inherited = parent.as_ref().map(|p| &p.settings);
        let kind = match draft.kind {
            Some(DraftKind::Pause(duration)) => OperationKind::Pause(duration),
            Some(DraftKind::Topic(resource)) => OperationKind::DataStructure {
                resource,
                test_case: draft
                    .test_case
                    .or_else(|| inherited.and_then(|s| inherited_test_case(&s.kind)))
                    .unwrap_or(TestCase::Write),
            },
            None => match inherited.map(|s| &s.kind) {
                Some(OperationKind::Pause(duration)) => OperationKind::Pause(*duration),
                Some(OperationKind::DataStructure {
                    resource,
                    test_case,
                }) => OperationKind::DataStructure {
                    resource: resource.clone(),
                    test_case: draft.test_case.unwrap_or(*test_case),
                },
                None => OperationKind::DataStructure {
                    resource: DEFAULT_RESOURCE.to_owned(),
                    test_case: draft.test_case.unwrap_or(TestCase::Write),
                },
            },
        };

        macro_rules! pick {
            ($local:expr, $field:ident, $default:expr) => {
                $local
                    .or_else(|| inherited.map(|s| s.$field.clone()))
                    .unwrap_or($default)
            };
        }
        macro_rules! pick_transport {
            ($local:expr, $field:ident) => {
                $local.or_else(|| inherited.and_then(|s| s.transport.$field))
            };
        }

        let settings = OperationSettings {
            kind,
            total_entry_count: positive(
                name,
                "totalEntryCount",
                pick!(draft.total_entry_count, total_entry_count, DEFAULT_TOTAL_ENTRY_COUNT),
            )?,
            payload_size: pick!(draft.payload_size, payload_size, DEFAULT_PAYLOAD_SIZE),
            batch_size: positive(
                name,
                "batchSize",
                pick!(draft.batch_size, batch_size, DEFAULT_BATCH_SIZE),
            )?,
            transport: TransportTuning {
                batch_size: pick_transport!(draft.kafka_batch_size, batch_size),
                linger_ms: pick_transport!(draft.kafka_linger_ms, linger_ms),
                fetch_size: pick_transport!(draft.kafka_fetch_size, fetch_size),
                fetch_ms: pick_transport!(draft.kafka_fetch_ms, fetch_ms),
                compression: draft
                    .compression
                    .or_else(|| inherited.map(|s| s.transport.compression))
                    .unwrap_or_default(),
            },
            key_prefix: pick!(draft.key_prefix, key_prefix, DEFAULT_KEY_PREFIX.to_owned()),
            start_num: positive_u64(
                name,
                "key.startNum",
                pick!(draft.start_num, start_num, DEFAULT_START_NUM),
            )?,
            random_seed: pick!(draft.random_seed, random_seed, DEFAULT_RANDOM_SEED),
            factory_class: draft
                .factory_class
                .clone()
                .or_else(|| inherited.and_then(|s| s.factory_class.clone())),
        };

        let factory = match &draft.factory_class {
            Some(class) => Some(self.create_factory(name, class)?),
            None => parent.as_ref().and_then(|p| p.factory.clone()),
        };

        Ok(Some(Arc::new(Operation {
            name: name.to_owned(),
            settings,
            factory,
        })))
    }

    fn create_factory(
        &self,
        operation: &str,
        class: &str,
    ) -> Result<Arc<dyn DataObjectFactory>, ConfigError> {
        let mut props = self.props.with_prefix(&format!("{operation}.factory."));
        props = props
            .into_iter()
            .map(|(k, v)| (format!("factory.{k}"), v))
            .collect();
        for (k, v) in self.props.with_prefix(&format!("{operation}.key.")) {
            props.insert(format!("key.{k}"), v);
        }
        match self.factories.create(class, &props) {
            None => Err(ConfigError::UnknownFactory {
                operation: operation.to_owned(),
                class: class.to_owned(),
            }),
            Some(Err(err)) => Err(ConfigError::InvalidValue {
                key: format!("{operation}.factory.*"),
                value: err.to_string(),
            }),
            Some(Ok(factory)) => Ok(factory),
        }
    }
}

fn inherited_test_case(kind: &OperationKind) -> Option<TestCase> {
    match kind {
        OperationKind::DataStructure { test_case, .. } => Some(*test_case),
        OperationKind::Pause(_) => None,
    }
}

fn positive_u64(operation: &str, field: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        Err(ConfigError::NonPositive {
            operation: operation.to_owned(),
            field,
            value: 0,
        })
    } else {
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(pairs: &[(&str, &str)]) -> OperationRegistry {
        let props: Properties = pairs.iter().copied().collect();
        OperationRegistry::new(Arc::new(props), FactoryRegistry::with_builtins())
    }

    #[test]
    fn empty_operation_gets_documented_defaults() {
        let mut reg = registry(&[]);
        let op = reg.resolve("bare").unwrap().unwrap();
        let s = &op.settings;
        assert_eq!(
            s.kind,
            OperationKind::DataStructure {
                resource: "map1".into(),
                test_case: TestCase::Write
            }
        );
        assert_eq!(s.payload_size, 1024);
        assert_eq!(s.batch_size, 100);
        assert_eq!(s.key_prefix, "k");
        assert_eq!(s.start_num, 1);
        assert_eq!(s.total_entry_count, 10_000);
        assert_eq!(s.transport.compression, Compression::None);
        assert_eq!(s.random_seed, 1);
        assert!(op.factory.is_none());
    }

    #[test]
    fn resolving_twice_returns_same_instance() {
        let mut reg = registry(&[("op1.topic", "t1")]);
        let a = reg.resolve("op1").unwrap().unwrap();
        let b = reg.resolve("op1").unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn reference_copies_every_unset_field() {
        let mut reg = registry(&[
            ("base.topic", "orders"),
            ("base.testCase", "writeBatch"),
            ("base.payloadSize", "64"),
            ("base.key.prefix", "o"),
            ("base.key.startNum", "100"),
            ("base.totalEntryCount", "5000"),
            ("base.batchSize", "50"),
            ("base.kafka.batchSize", "16384"),
            ("base.kafka.lingerMs", "5"),
            ("base.kafka.fetchSize", "1024"),
            ("base.kafka.fetchMs", "10"),
            ("base.kafka.compression", "lz4"),
            ("base.randomSeed", "42"),
            ("copy.ref", "base"),
        ]);
        let base = reg.resolve("base").unwrap().unwrap();
        let copy = reg.resolve("copy").unwrap().unwrap();
        assert_eq!(copy.name, "copy");
        assert_eq!(copy.settings, base.settings);
    }

    #[test]
    fn local_fields_override_reference() {
        let mut reg = registry(&[
            ("base.topic", "orders"),
            ("base.payloadSize", "64"),
            ("child.ref", "base"),
            ("child.payloadSize", "128"),
            ("child.testCase", "read"),
        ]);
        let child = reg.resolve("child").unwrap().unwrap();
        assert_eq!(child.resource(), Some("orders"));
        assert_eq!(child.test_case(), Some(TestCase::Read));
        assert_eq!(child.settings.payload_size, 128);
    }

    #[test]
    fn unknown_compression_falls_back_to_none() {
        let mut reg = registry(&[("op.kafka.compression", "brotli"), ("op2.kafka.compression", "zstd")]);
        let op = reg.resolve("op").unwrap().unwrap();
        assert_eq!(op.settings.transport.compression, Compression::None);
        let op2 = reg.resolve("op2").unwrap().unwrap();
        assert_eq!(op2.settings.transport.compression, Compression::Zstd);
    }

    #[test]
    fn zero_pause_is_dropped_and_garbage_pause_is_fatal() {
        let mut reg = registry(&[("nap.sleep", "0"), ("bad.sleep", "abc"), ("ok.sleep", "20")]);
        assert!(reg.resolve("nap").unwrap().is_none());
        assert!(matches!(
            reg.resolve("bad"),
            Err(ConfigError::InvalidPause { .. })
        ));
        let ok = reg.resolve("ok").unwrap().unwrap();
        assert_eq!(ok.settings.kind, OperationKind::Pause(Duration::from_millis(20)));
        assert_eq!(ok.resource(), None);
    }

    #[test]
    fn reference_errors_are_fatal() {
        let mut reg = registry(&[("a.ref", "missing")]);
        assert!(matches!(
            reg.resolve("a"),
            Err(ConfigError::UnknownOperation { .. })
        ));

        let mut reg = registry(&[("a.ref", "b"), ("b.ref", "a")]);
        assert!(matches!(reg.resolve("a"), Err(ConfigError::ReferenceCycle(_))));
    }

    #[test]
    fn non_positive_counts_are_rejected() {
        let mut reg = registry(&[("op.batchSize", "0")]);
        assert!(matches!(
            reg.resolve("op"),
            Err(ConfigError::NonPositive { field: "batchSize", .. })
        ));
        let mut reg = registry(&[("op.totalEntryCount", "lots")]);
        assert!(matches!(reg.resolve("op"), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_case_accepts_original_spellings() {
        assert_eq!(TestCase::parse("SENDBATCH"), TestCase::WriteBatch);
        assert_eq!(TestCase::parse("poll"), TestCase::Read);
        assert_eq!(TestCase::parse("readBatch"), TestCase::ReadBatch);
        assert_eq!(TestCase::parse("whatever"), TestCase::Write);
    }

    #[test]
    fn factory_binding_and_er_link() {
        let mut reg = registry(&[
            ("emp.topic", "employees"),
            ("emp.factory.class", "employee"),
            ("emp.factory.er.operation", "terr"),
            ("emp.factory.er.maxKeys", "3"),
            ("terr.topic", "territories"),
            ("terr.factory.class", "employee-territory"),
        ]);
        let emp = reg.resolve("emp").unwrap().unwrap();
        assert_eq!(emp.er_operation_name(), Some("terr"));
        assert_eq!(emp.key_for(5), "e000005");

        let mut reg = registry(&[("x.factory.class", "nope")]);
        assert!(matches!(reg.resolve("x"), Err(ConfigError::UnknownFactory { .. })));
    }
}
