//! Role registry.
//!
//! Maps every role to its [`Topology`]: schema, worker selector, shard
//! count, queue capacity and merge policy. The registry is built once at
//! startup and shared by reference; it never changes afterwards.

mod selector;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::schema::{Record, Schema};

pub use selector::{stable_hash, SelectorPolicy, WorkerSelector};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("role {0} is registered twice")]
    DuplicateRole(Role),
    #[error("unknown role {0}")]
    UnknownRole(Role),
    #[error("role {role}: queue capacity {capacity} is not a power of two")]
    QueueCapacity { role: Role, capacity: usize },
    #[error("role {0}: shard count must be positive")]
    NoShards(Role),
    #[error("role {0} has add or cover columns and must use consistent-hash routing")]
    RoundRobinWithMergeableColumns(Role),
}

/// Name of a category of deltas sharing one schema and one topology.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Role(Arc<str>);

impl Role {
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Role {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Tunables applied when a role is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologySettings {
    pub shards: usize,
    pub queue_capacity: usize,
    /// Fold buffered rows with the stored row before writing. `None` picks
    /// the schema default: merge when any column is `Add` or `Cover`.
    pub need_merge_with_storage: Option<bool>,
    /// Routing override. `None` picks the schema default.
    pub selector: Option<SelectorPolicy>,
}

impl Default for TopologySettings {
    fn default() -> Self {
        Self {
            shards: 2,
            queue_capacity: 4096,
            need_merge_with_storage: None,
            selector: None,
        }
    }
}

/// Routing and persistence layout of one role.
#[derive(Debug)]
pub struct Topology {
    role: Role,
    schema: Arc<Schema>,
    selector: WorkerSelector,
    queue_capacity: usize,
    need_merge_with_storage: bool,
}

impl Topology {
    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn selector(&self) -> &WorkerSelector {
        &self.selector
    }

    pub fn shards(&self) -> usize {
        self.selector.shard_count()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn need_merge_with_storage(&self) -> bool {
        self.need_merge_with_storage
    }
}

/// A role's schema as provided by a [`SchemaSource`].
#[derive(Debug, Clone)]
pub struct RoleDefinition {
    pub role: Role,
    pub schema: Arc<Schema>,
}

impl RoleDefinition {
    pub fn of<R: Record>() -> Self {
        Self {
            role: Role::new(R::ROLE),
            schema: Arc::new(R::schema().clone()),
        }
    }
}

/// Supplies the role definitions the registry is built from.
pub trait SchemaSource {
    fn definitions(&self) -> Vec<RoleDefinition>;
}

/// A fixed list of typed records.
#[derive(Debug, Default, Clone)]
pub struct StaticSchemaSource {
    definitions: Vec<RoleDefinition>,
}

impl StaticSchemaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R: Record>(mut self) -> Self {
        self.definitions.push(RoleDefinition::of::<R>());
        self
    }
}

impl SchemaSource for StaticSchemaSource {
    fn definitions(&self) -> Vec<RoleDefinition> {
        self.definitions.clone()
    }
}

/// Immutable role-to-topology table.
#[derive(Debug, Default)]
pub struct RoleRegistry {
    roles: BTreeMap<Role, Topology>,
}

impl RoleRegistry {
    /// Builds a registry from every definition in `source`, asking
    /// `settings` for the tunables of each role.
    pub fn from_source<S, F>(source: &S, mut settings: F) -> Result<Self, RegistryError>
    where
        S: SchemaSource + ?Sized,
        F: FnMut(&Role) -> TopologySettings,
    {
        let mut registry = Self::default();
        for definition in source.definitions() {
            let role_settings = settings(&definition.role);
            registry.register(definition, role_settings)?;
        }
        Ok(registry)
    }

    /// Adds one role. Rejects duplicates and invalid settings.
    pub fn register(
        &mut self,
        definition: RoleDefinition,
        settings: TopologySettings,
    ) -> Result<(), RegistryError> {
        let RoleDefinition { role, schema } = definition;

        if self.roles.contains_key(&role) {
            return Err(RegistryError::DuplicateRole(role));
        }
        if settings.shards == 0 {
            return Err(RegistryError::NoShards(role));
        }
        if !settings.queue_capacity.is_power_of_two() {
            return Err(RegistryError::QueueCapacity {
                role,
                capacity: settings.queue_capacity,
            });
        }

        let mergeable = schema.has_mergeable_columns();
        let policy = match settings.selector {
            Some(SelectorPolicy::RoundRobin) if mergeable => {
                return Err(RegistryError::RoundRobinWithMergeableColumns(role));
            }
            Some(policy) => policy,
            None if mergeable => SelectorPolicy::ConsistentHash,
            None => SelectorPolicy::RoundRobin,
        };

        let topology = Topology {
            role: role.clone(),
            schema,
            selector: WorkerSelector::new(policy, settings.shards),
            queue_capacity: settings.queue_capacity,
            need_merge_with_storage: settings.need_merge_with_storage.unwrap_or(mergeable),
        };

        tracing::debug!(
            role = %role,
            shards = settings.shards,
            queue_capacity = settings.queue_capacity,
            selector = policy.as_str(),
            need_merge_with_storage = topology.need_merge_with_storage,
            "registered role",
        );

        self.roles.insert(role, topology);
        Ok(())
    }

    pub fn get(&self, role: &Role) -> Option<&Topology> {
        self.roles.get(role)
    }

    pub fn topology(&self, role: &Role) -> Result<&Topology, RegistryError> {
        self.get(role)
            .ok_or_else(|| RegistryError::UnknownRole(role.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Topology> {
        self.roles.values()
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}
