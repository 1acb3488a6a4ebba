use crate::config::{Properties, default_thread_count};
use crate::er::OperationMap;
use crate::error::ConfigError;
use crate::operation::{Operation, OperationRegistry};
use std::collections::HashSet;
use std::sync::Arc;

pub const DEFAULT_TOTAL_INVOCATION_COUNT: u32 = 10_000;
pub const DEFAULT_OPERATIONS: &str = "writebatch";

/// Operations executed together by a pool of worker threads.
#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub thread_count: u32,
    pub total_invocation_count: u32,
    /// Top-level steps in first-seen configuration order, duplicates removed.
    pub operations: Vec<Arc<Operation>>,
    /// ER children reachable from `operations`. They always receive a
    /// producer; only those also listed in `operations` run as steps.
    pub er_operations: Vec<Arc<Operation>>,
    pub operations_str: String,
    pub comment: String,
}

impl Group {
    pub fn invocations_per_thread(&self) -> u32 {
        self.total_invocation_count / self.thread_count
    }

    /// The configured total minus the remainder dropped by integer division.
    pub fn actual_total_invocation_count(&self) -> u64 {
        self.invocations_per_thread() as u64 * self.thread_count as u64
    }

    /// Steps then ER children, each operation once.
    pub fn all_operations(&self) -> impl Iterator<Item = &Arc<Operation>> {
        self.operations.iter().chain(
            self.er_operations
                .iter()
                .filter(move |child| !self.operations.iter().any(|op| op.name == child.name)),
        )
    }

    pub fn operation_map(&self) -> OperationMap {
        self.all_operations()
            .map(|op| (op.name.clone(), op.clone()))
            .collect()
    }
}

/// Groups meant to run at the same time.
#[derive(Debug, Clone)]
pub struct ConcurrentGroupSet {
    pub groups: Vec<Group>,
}

impl ConcurrentGroupSet {
    pub fn names(&self) -> String {
        self.groups
            .iter()
            .map(|g| g.name.as_str())
            .collect::<Vec<_>>()
            .join(" & ")
    }
}

/// Splits `groupNames` into sequential sets (`,`) of concurrent groups (`&`)
/// and resolves every operation they reference.
pub fn assemble_groups(
    props: &Properties,
    registry: &mut OperationRegistry,
) -> Result<Vec<ConcurrentGroupSet>, ConfigError> {
    let group_names = props.get("groupNames").unwrap_or("").trim();
    let mut sets = Vec::new();
    for set_names in group_names.split(',') {
        let mut groups = Vec::new();
        for name in set_names.split('&').map(str::trim).filter(|n| !n.is_empty()) {
            groups.push(assemble_group(props, registry, name)?);
        }
        if !groups.is_empty() {
            sets.push(ConcurrentGroupSet { groups });
        }
    }
    if sets.is_empty() {
        return Err(ConfigError::MissingGroupNames);
    }
    Ok(sets)
}

fn assemble_group(
    props: &Properties,
    registry: &mut OperationRegistry,
    name: &str,
) -> Result<Group, ConfigError> {
    let thread_count: u32 =
        props.get_parsed_or(&format!("{name}.threadCount"), default_thread_count())?;
    if thread_count == 0 {
        return Err(ConfigError::NonPositive {
            operation: name.to_owned(),
            field: "threadCount",
            value: 0,
        });
    }
    let total_invocation_count: u32 = props.get_parsed_or(
        &format!("{name}.totalInvocationCount"),
        DEFAULT_TOTAL_INVOCATION_COUNT,
    )?;
    let operations_str = props
        .get_or(&format!("{name}.operations"), DEFAULT_OPERATIONS)
        .to_owned();

    let mut seen = HashSet::new();
    let mut operations = Vec::new();
    for op_name in operations_str.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        if !seen.insert(op_name.to_owned()) {
            continue;
        }
        if let Some(op) = registry.resolve(op_name)? {
            operations.push(op);
        }
    }

    // Independent of the step list: a step may also be another step's child.
    let mut er_seen = HashSet::new();
    let mut er_operations = Vec::new();
    for op in &operations {
        let mut chain = vec![op.name.clone()];
        collect_er_children(props, registry, op, &mut chain, &mut er_seen, &mut er_operations)?;
    }

    Ok(Group {
        name: name.to_owned(),
        thread_count,
        total_invocation_count,
        operations,
        er_operations,
        operations_str,
        comment: props.get_or(&format!("{name}.comment"), "").to_owned(),
    })
}

fn collect_er_children(
    props: &Properties,
    registry: &mut OperationRegistry,
    parent: &Operation,
    chain: &mut Vec<String>,
    seen: &mut HashSet<String>,
    out: &mut Vec<Arc<Operation>>,
) -> Result<(), ConfigError> {
    let Some(child_name) = parent.er_operation_name() else {
        return Ok(());
    };
    if chain.iter().any(|n| n == child_name) {
        return Err(ConfigError::ReferenceCycle(child_name.to_owned()));
    }
    if !props.has_prefix(&format!("{child_name}.")) {
        return Err(ConfigError::UnknownOperation {
            name: child_name.to_owned(),
            referrer: parent.name.clone(),
        });
    }
    let Some(child) = registry.resolve(child_name)? else {
        return Ok(());
    };
    if seen.insert(child.name.clone()) {
        out.push(child.clone());
    }
    chain.push(child.name.clone());
    collect_er_children(props, registry, &child, chain, seen, out)?;
    chain.pop();
    Ok(())
}
