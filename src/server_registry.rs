//! Ordered server list. Index 0 is always the writer.

use indexmap::IndexMap;

/// A single server's static configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescriptor {
    /// Position in the registry. 0 is the writer.
    pub index: usize,
    /// Operator-facing identity. `reconfigure` diffs servers by this field,
    /// not by address: a server display name is its identity across a
    /// reconfiguration, by contract.
    pub name: String,
    /// Nominal load weight used by the reader selector.
    pub weight: f64,
    /// Per-query-group weight overrides.
    pub group_weights: IndexMap<String, f64>,
    /// Per-server max replication lag, in seconds. Falls back to the
    /// cluster-wide default when unset.
    pub max_lag: Option<f64>,
    /// Statically-replicated archive host (excluded from fresh-read
    /// candidate selection the way a lagging replica would be, but never
    /// alone triggers lagged-replica mode).
    pub is_static: bool,
}

impl ServerDescriptor {
    pub fn writer(name: impl Into<String>) -> Self {
        Self {
            index: 0,
            name: name.into(),
            weight: 0.0,
            group_weights: IndexMap::new(),
            max_lag: None,
            is_static: false,
        }
    }

    pub fn replica(index: usize, name: impl Into<String>, weight: f64) -> Self {
        Self {
            index,
            name: name.into(),
            weight,
            group_weights: IndexMap::new(),
            max_lag: None,
            is_static: false,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_max_lag(mut self, max_lag: f64) -> Self {
        self.max_lag = Some(max_lag);
        self
    }

    pub fn with_group_weight(mut self, group: impl Into<String>, weight: f64) -> Self {
        self.group_weights.insert(group.into(), weight);
        self
    }

    pub fn with_group_weights(mut self, weights: impl IntoIterator<Item = (String, f64)>) -> Self {
        self.group_weights.extend(weights);
        self
    }

    pub fn with_static(mut self, is_static: bool) -> Self {
        self.is_static = is_static;
        self
    }

    pub fn weight_for(&self, group: &str) -> f64 {
        self.group_weights.get(group).copied().unwrap_or(self.weight)
    }

    pub fn is_writer(&self) -> bool {
        self.index == 0
    }
}

/// Ordered list of server descriptors, index 0 is the writer.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: Vec<ServerDescriptor>,
}

impl ServerRegistry {
    /// Build a registry from a writer plus zero or more replicas. Indices
    /// are assigned by position: 0 for the writer, 1.. for replicas.
    pub fn new(writer: ServerDescriptor, replicas: Vec<ServerDescriptor>) -> Self {
        let mut servers = Vec::with_capacity(1 + replicas.len());
        let mut writer = writer;
        writer.index = 0;
        servers.push(writer);

        for (i, mut replica) in replicas.into_iter().enumerate() {
            replica.index = i + 1;
            servers.push(replica);
        }

        Self { servers }
    }

    pub fn writer_index(&self) -> usize {
        0
    }

    pub fn writer(&self) -> &ServerDescriptor {
        &self.servers[0]
    }

    pub fn get(&self, index: usize) -> Option<&ServerDescriptor> {
        self.servers.get(index)
    }

    pub fn replicas(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.servers.iter().skip(1)
    }

    pub fn all(&self) -> &[ServerDescriptor] {
        &self.servers
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// A single-server cluster has only the writer.
    pub fn is_single_server(&self) -> bool {
        self.servers.len() == 1
    }

    /// Compare two registries by server display name: a configuration that
    /// replaces one server with another of the same name is treated as a
    /// no-op. Returns `true` if `other` removed any server present in
    /// `self` (by name).
    pub fn removed_any(&self, other: &ServerRegistry) -> bool {
        self.servers
            .iter()
            .any(|s| !other.servers.iter().any(|o| o.name == s.name))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn registry() -> ServerRegistry {
        ServerRegistry::new(
            ServerDescriptor::writer("writer"),
            vec![
                ServerDescriptor::replica(1, "replica-a", 10.0).with_max_lag(0.1),
                ServerDescriptor::replica(2, "replica-b", 10.0).with_max_lag(6.0),
            ],
        )
    }

    #[test]
    fn test_indices_assigned_by_position() {
        let reg = registry();
        assert_eq!(reg.writer().index, 0);
        assert_eq!(reg.get(1).unwrap().name, "replica-a");
        assert_eq!(reg.get(2).unwrap().name, "replica-b");
    }

    #[test]
    fn test_removed_any_false_on_rename_preserving_identity() {
        // Same names, different order/weights -> not a removal.
        let a = registry();
        let b = ServerRegistry::new(
            ServerDescriptor::writer("writer"),
            vec![
                ServerDescriptor::replica(1, "replica-a", 20.0),
                ServerDescriptor::replica(2, "replica-b", 5.0),
            ],
        );
        assert!(!a.removed_any(&b));
    }

    #[test]
    fn test_removed_any_true_when_name_dropped() {
        let a = registry();
        let b = ServerRegistry::new(
            ServerDescriptor::writer("writer"),
            vec![ServerDescriptor::replica(1, "replica-a", 10.0)],
        );
        assert!(a.removed_any(&b));
    }

    #[test]
    fn test_replace_same_name_is_a_no_op() {
        // A different server entirely, but sharing a display name, doesn't
        // count as a removal -- this is the documented operator contract.
        let a = registry();
        let b = ServerRegistry::new(
            ServerDescriptor::writer("writer"),
            vec![
                ServerDescriptor::replica(1, "replica-a", 999.0).with_max_lag(99.0),
                ServerDescriptor::replica(2, "replica-b", 10.0),
            ],
        );
        assert!(!a.removed_any(&b));
    }
}
