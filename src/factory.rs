use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

/// One synthesized record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
}

/// Synthesizes keyed records for an operation and describes its
/// parent/child (ER) topology.
///
/// Factories are initialized once during configuration resolution and then
/// shared read-only by every worker, so implementations must not rely on
/// interior mutability for record generation.
pub trait DataObjectFactory: Send + Sync + Debug {
    /// Receives every `<op>.factory.*` and `<op>.key.*` property with the
    /// `<op>.` prefix removed.
    fn initialize(&mut self, props: &BTreeMap<String, String>) -> Result<()>;

    fn is_er(&self) -> bool {
        self.er_operation_name().is_some()
    }

    /// Upper bound of children written per parent record.
    fn max_er_keys(&self) -> u32 {
        0
    }

    /// When true the child count is drawn uniformly from `[1, max_er_keys]`.
    fn is_er_max_random(&self) -> bool {
        false
    }

    fn er_operation_name(&self) -> Option<&str> {
        None
    }

    fn create_entry(&self, id: u64, parent_key: Option<&str>) -> Result<Entry>;

    fn get_key(&self, id: u64) -> String;

    /// Name of the record type, used as the table name in database mode.
    fn entity_name(&self) -> &str;
}

type Constructor = fn() -> Box<dyn DataObjectFactory>;

/// Maps `<op>.factory.class` values to factory constructors.
#[derive(Clone)]
pub struct FactoryRegistry {
    constructors: HashMap<String, Constructor>,
}

impl FactoryRegistry {
    pub fn empty() -> Self {
        FactoryRegistry {
            constructors: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("blob", || Box::new(BlobFactory::default()));
        registry.register("employee", || Box::new(EmployeeFactory::default()));
        registry.register("employee-territory", || {
            Box::new(EmployeeTerritoryFactory::default())
        });
        registry
    }

    pub fn register(&mut self, class: &str, constructor: Constructor) {
        self.constructors.insert(class.to_owned(), constructor);
    }

    /// Instantiates and initializes the named factory. `None` if the class is
    /// unknown.
    pub fn create(
        &self,
        class: &str,
        props: &BTreeMap<String, String>,
    ) -> Option<Result<Arc<dyn DataObjectFactory>>> {
        let constructor = self.constructors.get(class)?;
        let mut factory = constructor();
        Some(factory.initialize(props).map(|_| Arc::from(factory)))
    }
}

fn parse_prop<T: std::str::FromStr>(
    props: &BTreeMap<String, String>,
    key: &str,
    default: T,
) -> Result<T> {
    match props.get(key) {
        None => Ok(default),
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid factory property {key}='{v}'")),
    }
}

/// Shared ER settings read from `factory.er.*`.
#[derive(Debug, Default, Clone)]
struct ErLink {
    operation: Option<String>,
    max_keys: u32,
    random_max: bool,
}

impl ErLink {
    fn from_props(props: &BTreeMap<String, String>) -> Result<Self> {
        Ok(ErLink {
            operation: props.get("factory.er.operation").cloned(),
            max_keys: parse_prop(props, "factory.er.maxKeys", 5)?,
            random_max: parse_prop(props, "factory.er.randomMax", false)?,
        })
    }
}

/// Opaque zero-filled payloads.
#[derive(Debug, Default)]
pub struct BlobFactory {
    prefix: String,
    payload_size: usize,
    er: ErLink,
}

impl DataObjectFactory for BlobFactory {
    fn initialize(&mut self, props: &BTreeMap<String, String>) -> Result<()> {
        self.prefix = props
            .get("factory.key.prefix")
            .or_else(|| props.get("key.prefix"))
            .cloned()
            .unwrap_or_else(|| "k".to_owned());
        self.payload_size = parse_prop(props, "factory.payloadSize", 1024)?;
        self.er = ErLink::from_props(props)?;
        Ok(())
    }

    fn max_er_keys(&self) -> u32 {
        self.er.max_keys
    }

    fn is_er_max_random(&self) -> bool {
        self.er.random_max
    }

    fn er_operation_name(&self) -> Option<&str> {
        self.er.operation.as_deref()
    }

    fn create_entry(&self, id: u64, _parent_key: Option<&str>) -> Result<Entry> {
        Ok(Entry {
            key: self.get_key(id),
            value: vec![0u8; self.payload_size],
        })
    }

    fn get_key(&self, id: u64) -> String {
        format!("{}{}", self.prefix, id)
    }

    fn entity_name(&self) -> &str {
        "blob"
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Employee<'a> {
    employee_id: &'a str,
    last_name: String,
    first_name: String,
    title: &'static str,
    city: &'static str,
    country: &'static str,
    reports_to: Option<&'a str>,
    extension: String,
}

const TITLES: [&str; 4] = [
    "Sales Representative",
    "Sales Manager",
    "Inside Sales Coordinator",
    "Vice President, Sales",
];
const CITIES: [(&str, &str); 4] = [
    ("Seattle", "USA"),
    ("Tacoma", "USA"),
    ("London", "UK"),
    ("Kirkland", "USA"),
];

/// Northwind-style employee records, usually the ER parent of
/// [`EmployeeTerritoryFactory`].
#[derive(Debug, Default)]
pub struct EmployeeFactory {
    prefix: String,
    er: ErLink,
}

impl DataObjectFactory for EmployeeFactory {
    fn initialize(&mut self, props: &BTreeMap<String, String>) -> Result<()> {
        self.prefix = props
            .get("factory.key.prefix")
            .cloned()
            .unwrap_or_else(|| "e".to_owned());
        self.er = ErLink::from_props(props)?;
        Ok(())
    }

    fn max_er_keys(&self) -> u32 {
        self.er.max_keys
    }

    fn is_er_max_random(&self) -> bool {
        self.er.random_max
    }

    fn er_operation_name(&self) -> Option<&str> {
        self.er.operation.as_deref()
    }

    fn create_entry(&self, id: u64, parent_key: Option<&str>) -> Result<Entry> {
        let key = self.get_key(id);
        let (city, country) = CITIES[(id % CITIES.len() as u64) as usize];
        let employee = Employee {
            employee_id: &key,
            last_name: format!("Last{id}"),
            first_name: format!("First{id}"),
            title: TITLES[(id % TITLES.len() as u64) as usize],
            city,
            country,
            reports_to: parent_key,
            extension: format!("{:04}", id % 10_000),
        };
        let value = serde_json::to_vec(&employee)?;
        Ok(Entry { key, value })
    }

    fn get_key(&self, id: u64) -> String {
        format!("{}{:06}", self.prefix, id)
    }

    fn entity_name(&self) -> &str {
        "employee"
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmployeeTerritory<'a> {
    employee_id: Option<&'a str>,
    territory_id: String,
}

/// Link records between an employee and a territory.
#[derive(Debug, Default)]
pub struct EmployeeTerritoryFactory {
    prefix: String,
    er: ErLink,
}

impl DataObjectFactory for EmployeeTerritoryFactory {
    fn initialize(&mut self, props: &BTreeMap<String, String>) -> Result<()> {
        self.prefix = props
            .get("factory.key.prefix")
            .cloned()
            .unwrap_or_else(|| "et".to_owned());
        self.er = ErLink::from_props(props)?;
        Ok(())
    }

    fn max_er_keys(&self) -> u32 {
        self.er.max_keys
    }

    fn is_er_max_random(&self) -> bool {
        self.er.random_max
    }

    fn er_operation_name(&self) -> Option<&str> {
        self.er.operation.as_deref()
    }

    fn create_entry(&self, id: u64, parent_key: Option<&str>) -> Result<Entry> {
        let territory = EmployeeTerritory {
            employee_id: parent_key,
            territory_id: format!("{:05}", id % 100_000),
        };
        Ok(Entry {
            key: self.get_key(id),
            value: serde_json::to_vec(&territory)?,
        })
    }

    fn get_key(&self, id: u64) -> String {
        format!("{}{:06}", self.prefix, id)
    }

    fn entity_name(&self) -> &str {
        "employee_territory"
    }
}
