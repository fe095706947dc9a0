/*!
 * Path resolution.
 *
 * Walks a [`PropertyPath`] against the device registry and the device's
 * object graph. Resolution starts from the registry on every call so that
 * no handle outlives a request.
 *
 * Leaves are reached through an accessor member whose name is derived from
 * the leaf name (`vel_limit` becomes `_vel_limit_property` with the default
 * naming). Callables are looked up under their own name.
 */
use std::sync::Arc;

use propbridge_core::config::ResolverConfig;
use propbridge_core::types::Value;
use propbridge_devices::{
    DeviceError, DeviceRegistry, Member, MemberKind, ObjectHandle, RemoteFunction, RemoteProperty,
};

use crate::path::{PathError, PropertyPath};

/// Naming convention of leaf accessors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessorNaming {
    prefix: String,
    suffix: String,
}

impl AccessorNaming {
    /// Create a naming convention
    pub fn new<P: Into<String>, S: Into<String>>(prefix: P, suffix: S) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    /// Address leaves under their own name
    pub fn identity() -> Self {
        Self::new("", "")
    }

    /// Get the accessor member name for a leaf
    pub fn accessor_name(&self, leaf: &str) -> String {
        format!("{}{}{}", self.prefix, leaf, self.suffix)
    }
}

impl Default for AccessorNaming {
    fn default() -> Self {
        Self::from(&ResolverConfig::default())
    }
}

impl From<&ResolverConfig> for AccessorNaming {
    fn from(config: &ResolverConfig) -> Self {
        Self::new(config.accessor_prefix.clone(), config.accessor_suffix.clone())
    }
}

/// A resolved leaf
#[derive(Debug, Clone)]
pub enum ResolvedLeaf {
    /// A remote property with read/write accessors
    Property(Arc<dyn RemoteProperty>),
    /// A plain value held by the handle
    Value(Value),
}

/// Resolves dotted paths into member handles
#[derive(Debug, Clone, Default)]
pub struct PathResolver {
    naming: AccessorNaming,
}

impl PathResolver {
    /// Create a resolver with the given accessor naming
    pub fn new(naming: AccessorNaming) -> Self {
        Self { naming }
    }

    /// Get the accessor naming
    pub fn naming(&self) -> &AccessorNaming {
        &self.naming
    }

    /// Resolve a path to a leaf for reading or writing
    pub fn resolve_leaf(
        &self,
        registry: &DeviceRegistry,
        path: &PropertyPath,
    ) -> Result<ResolvedLeaf, PathError> {
        let (parent, leaf) = self.parent(registry, path)?;
        let accessor = self.naming.accessor_name(leaf);
        match lookup(&parent, &accessor, path)? {
            Member::Property(property) => Ok(ResolvedLeaf::Property(property)),
            Member::Value(value) => Ok(ResolvedLeaf::Value(value)),
            other => Err(PathError::Lookup {
                path: path.to_string(),
                segment: accessor.clone(),
                source: DeviceError::WrongMemberKind {
                    name: accessor,
                    expected: MemberKind::Leaf,
                    found: other.kind(),
                },
            }),
        }
    }

    /// Resolve a path to a callable
    pub fn resolve_callable(
        &self,
        registry: &DeviceRegistry,
        path: &PropertyPath,
    ) -> Result<Arc<dyn RemoteFunction>, PathError> {
        let (parent, name) = self.parent(registry, path)?;
        lookup(&parent, name, path)?
            .into_function(name)
            .map_err(|source| PathError::Lookup {
                path: path.to_string(),
                segment: name.to_string(),
                source,
            })
    }

    /// Walk to the object holding the last segment
    fn parent<'p>(
        &self,
        registry: &DeviceRegistry,
        path: &'p PropertyPath,
    ) -> Result<(ObjectHandle, &'p str), PathError> {
        let Some((last, intermediate)) = path.members().split_last() else {
            return Err(PathError::NoMember(path.to_string()));
        };

        let mut object = registry.handle(path.device()).map_err(|e| match e {
            DeviceError::NotConnected => PathError::DeviceOffline(path.device().to_string()),
            _ => PathError::UnknownDevice(path.device().to_string()),
        })?;

        for segment in intermediate {
            object = lookup(&object, segment, path)?
                .into_object(segment)
                .map_err(|source| PathError::Lookup {
                    path: path.to_string(),
                    segment: segment.clone(),
                    source,
                })?;
        }

        Ok((object, last.as_str()))
    }
}

fn lookup(object: &ObjectHandle, name: &str, path: &PropertyPath) -> Result<Member, PathError> {
    object.member(name).map_err(|source| PathError::Lookup {
        path: path.to_string(),
        segment: name.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use propbridge_devices::sim::{SimDevice, SimObject};

    fn registry_with(device: &SimDevice) -> DeviceRegistry {
        let registry = DeviceRegistry::new("odrive");
        registry
            .register(device.serial().unwrap_or("unknown_serial"), device.handle())
            .unwrap();
        registry
    }

    fn path(raw: &str) -> PropertyPath {
        PropertyPath::parse(raw).unwrap()
    }

    #[test]
    fn test_accessor_name() {
        assert_eq!(AccessorNaming::default().accessor_name("accel"), "_accel_property");
        assert_eq!(AccessorNaming::identity().accessor_name("accel"), "accel");
    }

    #[test]
    fn test_resolve_nested_leaf() {
        let device = SimDevice::odrive_like("X1");
        let registry = registry_with(&device);
        let resolver = PathResolver::default();

        let leaf = resolver
            .resolve_leaf(&registry, &path("odrive0.axis0.config.calibration_lockin.accel"))
            .unwrap();
        assert!(matches!(leaf, ResolvedLeaf::Property(_)));

        let leaf = resolver.resolve_leaf(&registry, &path("odrive0.hw_version_major")).unwrap();
        assert!(matches!(leaf, ResolvedLeaf::Value(Value::Integer(3))));
    }

    #[test]
    fn test_resolve_callable_keeps_its_name() {
        let device = SimDevice::odrive_like("X1");
        let registry = registry_with(&device);
        let resolver = PathResolver::default();

        assert!(resolver.resolve_callable(&registry, &path("odrive0.reboot")).is_ok());
        assert!(resolver
            .resolve_callable(&registry, &path("odrive0.axis1.watchdog_feed"))
            .is_ok());
        assert!(resolver.resolve_leaf(&registry, &path("odrive0.reboot")).is_err());
    }

    #[test]
    fn test_unknown_and_offline_devices() {
        let device = SimDevice::odrive_like("X1");
        let registry = registry_with(&device);
        let resolver = PathResolver::default();

        let err = resolver.resolve_leaf(&registry, &path("odrive7.vbus_voltage")).unwrap_err();
        assert!(matches!(err, PathError::UnknownDevice(name) if name == "odrive7"));

        registry.mark_offline("odrive0").unwrap();
        let err = resolver.resolve_leaf(&registry, &path("odrive0.vbus_voltage")).unwrap_err();
        assert!(matches!(err, PathError::DeviceOffline(_)));
    }

    #[test]
    fn test_missing_members() {
        let device = SimDevice::odrive_like("X1");
        let registry = registry_with(&device);
        let resolver = PathResolver::default();

        let err = resolver.resolve_leaf(&registry, &path("odrive0.axis9.pos_estimate")).unwrap_err();
        assert!(matches!(err, PathError::Lookup { ref segment, .. } if segment == "axis9"));

        let err = resolver.resolve_leaf(&registry, &path("odrive0.vbus_voltage.x")).unwrap_err();
        assert!(matches!(
            err,
            PathError::Lookup { source: DeviceError::WrongMemberKind { .. }, .. }
        ));

        let err = resolver.resolve_leaf(&registry, &path("odrive0")).unwrap_err();
        assert!(matches!(err, PathError::NoMember(_)));
    }

    #[test]
    fn test_identity_naming_against_plain_backend() {
        let registry = DeviceRegistry::new("dev");
        registry
            .register(
                "S1",
                Arc::new(SimObject::builder().accessor("", "").property("gain", 1.0).build()),
            )
            .unwrap();

        let resolver = PathResolver::new(AccessorNaming::identity());
        assert!(resolver.resolve_leaf(&registry, &path("dev0.gain")).is_ok());
    }
}
