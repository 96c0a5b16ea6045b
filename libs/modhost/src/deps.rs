//! Typed dependency declaration and lookup.
//!
//! A module declares the module *types* it needs; the container resolves each
//! declared type to the single constructed instance and hands the set to the
//! module's constructor. Lookup is keyed by `TypeId`, so only declared
//! dependencies are reachable.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::contracts::ModuleFactory;
use crate::error::ContainerError;

/// Stable key for a module type.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct TypeKey {
    id: TypeId,
    type_name: &'static str,
}

impl TypeKey {
    #[inline]
    #[must_use]
    pub fn of<T: ?Sized + 'static>() -> Self {
        TypeKey {
            id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name)
    }
}

/// One declared dependency: the module type and its registered name.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct DependencySpec {
    pub name: &'static str,
    pub key: TypeKey,
}

impl DependencySpec {
    #[must_use]
    pub fn of<M: ModuleFactory>() -> Self {
        Self {
            name: M::NAME,
            key: TypeKey::of::<M>(),
        }
    }
}

/// Ordered, duplicate-free list of dependencies.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dependencies {
    specs: Vec<DependencySpec>,
}

impl Dependencies {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with<M: ModuleFactory>(mut self) -> Self {
        self.push(DependencySpec::of::<M>());
        self
    }

    /// Union of `lists`, first occurrence wins the position.
    ///
    /// ```ignore
    /// fn dependencies() -> Dependencies {
    ///     Dependencies::merge([Base::dependencies(), Dependencies::new().with::<Cache>()])
    /// }
    /// ```
    pub fn merge<I>(lists: I) -> Self
    where
        I: IntoIterator<Item = Dependencies>,
    {
        let mut merged = Self::new();
        for list in lists {
            for spec in list.specs {
                merged.push(spec);
            }
        }
        merged
    }

    fn push(&mut self, spec: DependencySpec) {
        if !self.specs.iter().any(|s| s.key == spec.key) {
            self.specs.push(spec);
        }
    }

    #[must_use]
    pub fn contains<M: ModuleFactory>(&self) -> bool {
        let key = TypeKey::of::<M>();
        self.specs.iter().any(|s| s.key == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DependencySpec> {
        self.specs.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.specs.iter().map(|s| s.name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

pub(crate) type Instance = Arc<dyn Any + Send + Sync>;

/// Constructed dependencies handed to [`ModuleFactory::build`].
pub struct Resolved {
    module: &'static str,
    instances: HashMap<TypeKey, (&'static str, Instance)>,
}

impl Resolved {
    pub(crate) fn new(
        module: &'static str,
        instances: impl IntoIterator<Item = (TypeKey, &'static str, Instance)>,
    ) -> Self {
        Self {
            module,
            instances: instances
                .into_iter()
                .map(|(key, name, instance)| (key, (name, instance)))
                .collect(),
        }
    }

    /// Typed handle to a declared dependency.
    ///
    /// # Errors
    /// `ContainerError::UndeclaredDependency` when `M` was not declared by the
    /// module being constructed.
    pub fn get<M: ModuleFactory>(&self) -> Result<Arc<M>, ContainerError> {
        self.instances
            .get(&TypeKey::of::<M>())
            .and_then(|(_, instance)| instance.clone().downcast::<M>().ok())
            .ok_or_else(|| ContainerError::UndeclaredDependency {
                module: self.module.to_owned(),
                dependency: M::NAME.to_owned(),
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.instances.values().map(|(name, _)| *name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
