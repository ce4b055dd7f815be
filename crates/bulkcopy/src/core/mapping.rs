//! Entity type to table name registry.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

use crate::core::rows::BulkEntity;

/// Identity of an entity type, captured where the type is still known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityType {
    id: TypeId,
    name: &'static str,
    declared_table: Option<&'static str>,
}

impl EntityType {
    /// Descriptor for `T`.
    pub fn of<T: BulkEntity>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            declared_table: T::table_name(),
        }
    }

    /// Rust type name, for logs.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Registry from entity type to table name.
///
/// Entries are populated on first lookup from the type's declared table name
/// and live as long as the registry. Explicit registrations replace them.
#[derive(Debug, Default)]
pub struct TableMappings {
    entries: RwLock<HashMap<TypeId, String>>,
}

impl TableMappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `T` to `table`, replacing any previous entry.
    pub fn register<T: BulkEntity>(&self, table: impl Into<String>) {
        let table = table.into();
        debug!("Mapping {} -> {}", std::any::type_name::<T>(), table);
        self.write().insert(TypeId::of::<T>(), table);
    }

    /// Table name for `T`, if one is registered or declared.
    pub fn resolve<T: BulkEntity>(&self) -> Option<String> {
        self.get(EntityType::of::<T>())
    }

    /// Table name for a captured entity type.
    pub fn get(&self, entity: EntityType) -> Option<String> {
        if let Some(table) = self.read().get(&entity.id) {
            return Some(table.clone());
        }

        let declared = entity.declared_table?;
        let mut entries = self.write();
        let table = entries
            .entry(entity.id)
            .or_insert_with(|| declared.to_string());
        Some(table.clone())
    }

    /// Whether an entry exists for `T` (declared names count once looked up).
    pub fn contains<T: BulkEntity>(&self) -> bool {
        self.read().contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TypeId, String>> {
        // A panic while holding the lock cannot leave the map half-written.
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TypeId, String>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::SqlValue;

    struct Declared;
    struct Undeclared;

    impl BulkEntity for Declared {
        fn columns() -> &'static [&'static str] {
            &["id"]
        }
        fn to_row(&self) -> Vec<SqlValue> {
            vec![SqlValue::I32(1)]
        }
        fn table_name() -> Option<&'static str> {
            Some("declared_rows")
        }
    }

    impl BulkEntity for Undeclared {
        fn columns() -> &'static [&'static str] {
            &["id"]
        }
        fn to_row(&self) -> Vec<SqlValue> {
            vec![SqlValue::I32(1)]
        }
    }

    #[test]
    fn test_declared_name_populates_on_first_use() {
        let mappings = TableMappings::new();
        assert!(!mappings.contains::<Declared>());
        assert_eq!(mappings.resolve::<Declared>().as_deref(), Some("declared_rows"));
        assert!(mappings.contains::<Declared>());
        assert_eq!(mappings.len(), 1);
    }

    #[test]
    fn test_register_overrides_declared_name() {
        let mappings = TableMappings::new();
        mappings.register::<Declared>("archive.rows");
        assert_eq!(mappings.resolve::<Declared>().as_deref(), Some("archive.rows"));
    }

    #[test]
    fn test_unknown_type_resolves_to_none() {
        let mappings = TableMappings::new();
        assert_eq!(mappings.resolve::<Undeclared>(), None);
        assert!(mappings.is_empty());
    }

    #[test]
    fn test_registries_are_isolated() {
        let a = TableMappings::new();
        let b = TableMappings::new();
        a.register::<Undeclared>("only_in_a");
        assert_eq!(a.resolve::<Undeclared>().as_deref(), Some("only_in_a"));
        assert_eq!(b.resolve::<Undeclared>(), None);
    }
}
