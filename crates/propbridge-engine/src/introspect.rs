/*!
 * Tree introspection.
 *
 * Produces a serializable snapshot of a device's property tree. Leaves carry
 * their stringified value and type, callables are recorded as the marker
 * `"function"` and sub-trees nest. Members whose name starts with the hidden
 * prefix are skipped, and any member that fails to read is left out instead
 * of failing the whole snapshot.
 */
use std::collections::BTreeMap;
use std::time::Duration;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use tracing::{debug, trace};

use propbridge_core::bridge::{ExecutionBridge, Outcome};
use propbridge_core::config::{BridgeConfig, ResolverConfig};
use propbridge_core::types::{LeafType, Value};
use propbridge_devices::{DeviceError, Member, MemberKind, ObjectHandle};

/// Marker emitted for callable members
pub const FUNCTION_MARKER: &str = "function";

/// Snapshot of a single leaf
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeafSnapshot {
    /// The stringified value
    pub val: String,
    /// Whether the leaf is read-only; always reported as `false`
    pub readonly: bool,
    /// The value type label
    #[serde(rename = "type")]
    pub leaf_type: LeafType,
}

impl From<&Value> for LeafSnapshot {
    fn from(value: &Value) -> Self {
        Self {
            val: value.stringify(),
            readonly: false,
            leaf_type: value.leaf_type(),
        }
    }
}

/// Snapshot of a property tree, keyed by member name
pub type TreeSnapshot = BTreeMap<String, SnapshotEntry>;

/// One member of a tree snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotEntry {
    /// A leaf with its current value
    Leaf(LeafSnapshot),
    /// A nested sub-tree
    Tree(TreeSnapshot),
    /// A callable member
    Function,
}

impl Serialize for SnapshotEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SnapshotEntry::Leaf(leaf) => leaf.serialize(serializer),
            SnapshotEntry::Tree(tree) => {
                let mut map = serializer.serialize_map(Some(tree.len()))?;
                for (name, entry) in tree {
                    map.serialize_entry(name, entry)?;
                }
                map.end()
            }
            SnapshotEntry::Function => serializer.serialize_str(FUNCTION_MARKER),
        }
    }
}

/// Result of introspecting a tree
#[derive(Debug, Clone, Default)]
pub struct Introspection {
    /// The snapshot
    pub tree: TreeSnapshot,
    /// Dotted names (relative to the root) of members left out after a failure
    pub omitted: Vec<String>,
    /// Whether any failure was classified as a lost connection
    pub connection_lost: bool,
}

/// Builds tree snapshots from remote-object handles
#[derive(Debug, Clone)]
pub struct Introspector {
    hidden_prefix: String,
    read_timeout: Duration,
}

impl Introspector {
    /// Create an introspector
    pub fn new<S: Into<String>>(hidden_prefix: S, read_timeout: Duration) -> Self {
        Self {
            hidden_prefix: hidden_prefix.into(),
            read_timeout,
        }
    }

    /// Create an introspector from configuration
    pub fn from_config(resolver: &ResolverConfig, bridge: &BridgeConfig) -> Self {
        Self::new(resolver.hidden_prefix.clone(), bridge.read_timeout())
    }

    /// Check whether a member name is hidden
    pub fn is_hidden(&self, name: &str) -> bool {
        !self.hidden_prefix.is_empty() && name.starts_with(&self.hidden_prefix)
    }

    /// Snapshot a tree, discarding the failure report
    pub fn snapshot(&self, handle: &ObjectHandle) -> TreeSnapshot {
        self.inspect(handle).tree
    }

    /// Snapshot a tree and report which members were left out
    pub fn inspect(&self, handle: &ObjectHandle) -> Introspection {
        let mut report = Introspection::default();
        report.tree = self.walk(handle, "", &mut report);
        report
    }

    fn walk(&self, object: &ObjectHandle, prefix: &str, report: &mut Introspection) -> TreeSnapshot {
        let mut tree = TreeSnapshot::new();

        let members = match object.members() {
            Ok(members) => members,
            Err(e) => {
                self.omit(prefix, &e, report);
                return tree;
            }
        };

        for info in members {
            if self.is_hidden(&info.name) {
                continue;
            }
            let qualified = if prefix.is_empty() {
                info.name.clone()
            } else {
                format!("{}.{}", prefix, info.name)
            };

            // Callables are marked from the listing alone, never looked up or invoked
            if info.kind == MemberKind::Callable {
                tree.insert(info.name, SnapshotEntry::Function);
                continue;
            }

            let member = match object.member(&info.name) {
                Ok(member) => member,
                Err(e) => {
                    self.omit(&qualified, &e, report);
                    continue;
                }
            };

            let entry = match member {
                Member::Function(_) => SnapshotEntry::Function,
                Member::Value(value) => SnapshotEntry::Leaf(LeafSnapshot::from(&value)),
                Member::Property(property) => {
                    let outcome = ExecutionBridge::run(
                        async move { property.read().await },
                        self.read_timeout,
                    );
                    match outcome {
                        Outcome::Completed(value) => SnapshotEntry::Leaf(LeafSnapshot::from(&value)),
                        Outcome::TimedOut => {
                            trace!("Read of {} timed out", qualified);
                            report.omitted.push(qualified);
                            continue;
                        }
                        Outcome::Failed(e) => {
                            self.omit(&qualified, &e, report);
                            continue;
                        }
                    }
                }
                Member::Object(child) => SnapshotEntry::Tree(self.walk(&child, &qualified, report)),
            };
            tree.insert(info.name, entry);
        }

        tree
    }

    fn omit(&self, name: &str, error: &DeviceError, report: &mut Introspection) {
        debug!("Omitting {} from snapshot: {}", name, error);
        if error.is_connection_loss() {
            report.connection_lost = true;
        }
        report.omitted.push(name.to_string());
    }
}
