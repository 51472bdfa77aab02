//! The entity trait.

use crate::Result;
use crate::meta::{FieldMeta, RelationMeta};
use crate::row::Row;
use crate::value::Value;

/// A persistable entity.
///
/// Implementations describe their mapping through const metadata and
/// convert themselves to and from [`Row`]s. Everything the unit of
/// work does, from snapshotting to commit ordering, is driven by this
/// surface; no other coupling to concrete types exists.
pub trait Entity: Send + Sync + 'static {
    /// Table name
    const TABLE_NAME: &'static str;

    /// Optional schema qualifier
    const SCHEMA: Option<&'static str> = None;

    /// Primary key column name(s)
    const PRIMARY_KEY: &'static [&'static str];

    /// Optimistic version column, if the entity is versioned
    const VERSION_COLUMN: Option<&'static str> = None;

    /// Field metadata, in declaration order.
    fn fields() -> &'static [FieldMeta];

    /// Relation metadata.
    fn relations() -> &'static [RelationMeta] {
        &[]
    }

    /// Convert this entity to a row of column values.
    fn to_row(&self) -> Row;

    /// Construct an entity from a row.
    #[allow(clippy::result_large_err)]
    fn from_row(row: &Row) -> Result<Self>
    where
        Self: Sized;

    /// Merge the columns present in `row` into this entity, leaving
    /// absent columns untouched.
    #[allow(clippy::result_large_err)]
    fn apply_row(&mut self, row: &Row) -> Result<()>;

    /// Current primary key values, in `PRIMARY_KEY` order.
    /// Unassigned components are `Value::Null`.
    fn primary_key(&self) -> Vec<Value>;

    /// Write back a store-generated key after insert.
    ///
    /// Only called for entities with a single generated key column.
    fn set_generated_key(&mut self, _value: Value) {}

    /// Whether this entity has not been persisted yet.
    fn is_new(&self) -> bool {
        self.primary_key().iter().all(Value::is_null)
    }

    /// Current value of the version column, if versioned.
    fn version_value(&self) -> Option<Value> {
        Self::VERSION_COLUMN.and_then(|col| self.to_row().get_by_name(col).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Hero {
        id: Option<i64>,
        name: String,
        team_id: Option<i64>,
    }

    impl Entity for Hero {
        const TABLE_NAME: &'static str = "hero";
        const PRIMARY_KEY: &'static [&'static str] = &["id"];

        fn fields() -> &'static [FieldMeta] {
            const FIELDS: &[FieldMeta] = &[
                FieldMeta::new("id", "id").primary_key().generated(),
                FieldMeta::new("name", "name"),
                FieldMeta::new("team_id", "team_id")
                    .nullable()
                    .foreign_key("team.id"),
            ];
            FIELDS
        }

        fn to_row(&self) -> Row {
            Row::new(
                vec!["id".to_string(), "name".to_string(), "team_id".to_string()],
                vec![
                    self.id.into(),
                    self.name.clone().into(),
                    self.team_id.into(),
                ],
            )
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
                name: row.get_named("name")?,
                team_id: row.get_named("team_id")?,
            })
        }

        fn apply_row(&mut self, row: &Row) -> Result<()> {
            if row.contains_column("id") {
                self.id = row.get_named("id")?;
            }
            if row.contains_column("name") {
                self.name = row.get_named("name")?;
            }
            if row.contains_column("team_id") {
                self.team_id = row.get_named("team_id")?;
            }
            Ok(())
        }

        fn primary_key(&self) -> Vec<Value> {
            vec![self.id.into()]
        }

        fn set_generated_key(&mut self, value: Value) {
            self.id = value.as_i64();
        }
    }

    #[test]
    fn test_is_new() {
        let hero = Hero {
            id: None,
            name: "Spider-Boy".to_string(),
            team_id: None,
        };
        assert!(hero.is_new());

        let saved = Hero {
            id: Some(1),
            name: "Rusty-Man".to_string(),
            team_id: None,
        };
        assert!(!saved.is_new());
    }

    #[test]
    fn test_row_round_trip() {
        let hero = Hero {
            id: Some(7),
            name: "Deadpond".to_string(),
            team_id: Some(2),
        };
        let row = hero.to_row();
        let back = Hero::from_row(&row).unwrap();
        assert_eq!(back.id, Some(7));
        assert_eq!(back.name, "Deadpond");
        assert_eq!(back.team_id, Some(2));
    }

    #[test]
    fn test_apply_row_partial() {
        let mut hero = Hero {
            id: None,
            name: "Deadpond".to_string(),
            team_id: None,
        };
        hero.apply_row(&Row::single("team_id", Value::BigInt(3)))
            .unwrap();
        assert_eq!(hero.team_id, Some(3));
        assert_eq!(hero.name, "Deadpond");
    }

    #[test]
    fn test_set_generated_key() {
        let mut hero = Hero {
            id: None,
            name: "x".to_string(),
            team_id: None,
        };
        hero.set_generated_key(Value::BigInt(42));
        assert_eq!(hero.id, Some(42));
        assert!(!hero.is_new());
    }

    #[test]
    fn test_primary_key_null_when_new() {
        let hero = Hero {
            id: None,
            name: "x".to_string(),
            team_id: None,
        };
        assert_eq!(hero.primary_key(), vec![Value::Null]);
    }
}
