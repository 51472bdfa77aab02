//! End-to-end unit-of-work scenarios over an in-memory store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use serde_json::json;

use rowsync::prelude::*;
use rowsync::{
    Cond, ContextConfig, ExecResult, FieldMeta, LockWait, RelationMeta, RowLock, TxToken,
    semantic_eq,
};

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn run<T>(f: impl Future<Output = T>) -> T {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(f)
}

// ----------------------------------------------------------------------
// In-memory driver with real row storage and transactions
// ----------------------------------------------------------------------

type StoredRow = BTreeMap<String, Value>;

#[derive(Default)]
struct Store {
    tables: HashMap<&'static str, Vec<StoredRow>>,
    /// Auto-increment key per table: (column, next value)
    auto_keys: HashMap<&'static str, (&'static str, i64)>,
    /// Copy of `tables` per open transaction, taken at begin and
    /// restored on rollback
    journals: HashMap<u64, HashMap<&'static str, Vec<StoredRow>>>,
    next_tx: u64,
}

impl Store {
    fn matches(row: &StoredRow, cond: &[Cond]) -> bool {
        cond.iter().all(|(col, value)| {
            row.get(*col)
                .is_some_and(|stored| semantic_eq(stored, value))
        })
    }

    fn to_row(stored: &StoredRow) -> Row {
        Row::new(
            stored.keys().cloned().collect(),
            stored.values().cloned().collect(),
        )
    }
}

#[derive(Clone, Default)]
struct MemoryDriver {
    state: Arc<Mutex<Store>>,
}

impl MemoryDriver {
    fn new() -> Self {
        Self::default()
    }

    /// Declare a store-generated integer key for a table.
    fn auto_key(self, table: &'static str, column: &'static str) -> Self {
        self.state
            .lock()
            .unwrap()
            .auto_keys
            .insert(table, (column, 1));
        self
    }

    fn row_count(&self, table: &'static str) -> usize {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .map_or(0, Vec::len)
    }

    fn seed(&self, table: &'static str, row: Vec<(&str, Value)>) {
        let stored: StoredRow = row.into_iter().map(|(c, v)| (c.to_string(), v)).collect();
        self.state
            .lock()
            .unwrap()
            .tables
            .entry(table)
            .or_default()
            .push(stored);
    }

    fn value_of(&self, table: &'static str, cond: &[Cond], column: &str) -> Option<Value> {
        let state = self.state.lock().unwrap();
        state.tables.get(table).and_then(|rows| {
            rows.iter()
                .find(|r| Store::matches(r, cond))
                .and_then(|r| r.get(column).cloned())
        })
    }
}

impl Driver for MemoryDriver {
    fn find(
        &self,
        _cx: &Cx,
        table: &'static str,
        cond: &[Cond],
        _tx: Option<TxToken>,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = {
            let state = self.state.lock().unwrap();
            state
                .tables
                .get(table)
                .map(|rows| {
                    rows.iter()
                        .filter(|r| Store::matches(r, cond))
                        .map(Store::to_row)
                        .collect()
                })
                .unwrap_or_default()
        };
        async move { Outcome::Ok(result) }
    }

    fn find_one(
        &self,
        _cx: &Cx,
        table: &'static str,
        cond: &[Cond],
        _tx: Option<TxToken>,
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let result = {
            let state = self.state.lock().unwrap();
            state.tables.get(table).and_then(|rows| {
                rows.iter().find(|r| Store::matches(r, cond)).map(Store::to_row)
            })
        };
        async move { Outcome::Ok(result) }
    }

    fn insert(
        &self,
        _cx: &Cx,
        table: &'static str,
        columns: &[&'static str],
        values: Vec<Value>,
        _tx: Option<TxToken>,
    ) -> impl Future<Output = Outcome<ExecResult, Error>> + Send {
        let result = {
            let mut state = self.state.lock().unwrap();
            let mut stored: StoredRow = columns
                .iter()
                .map(|c| c.to_string())
                .zip(values)
                .collect();
            let mut insert_id = None;
            if let Some((column, next)) = state.auto_keys.get_mut(table) {
                let needs_key = stored.get(*column).is_none_or(Value::is_null);
                if needs_key {
                    stored.insert(column.to_string(), Value::BigInt(*next));
                    insert_id = Some(*next);
                    *next += 1;
                }
            }
            state.tables.entry(table).or_default().push(stored);
            ExecResult {
                rows_affected: 1,
                insert_id,
            }
        };
        async move { Outcome::Ok(result) }
    }

    fn insert_many(
        &self,
        _cx: &Cx,
        table: &'static str,
        columns: &[&'static str],
        rows: Vec<Vec<Value>>,
        _tx: Option<TxToken>,
    ) -> impl Future<Output = Outcome<ExecResult, Error>> + Send {
        let result = {
            let mut state = self.state.lock().unwrap();
            let count = rows.len() as u64;
            let entries = state.tables.entry(table).or_default();
            for values in rows {
                entries.push(columns.iter().map(|c| c.to_string()).zip(values).collect());
            }
            ExecResult::new(count)
        };
        async move { Outcome::Ok(result) }
    }

    fn update(
        &self,
        _cx: &Cx,
        table: &'static str,
        set: &[Cond],
        cond: &[Cond],
        _tx: Option<TxToken>,
    ) -> impl Future<Output = Outcome<ExecResult, Error>> + Send {
        let result = {
            let mut state = self.state.lock().unwrap();
            let mut affected = 0;
            if let Some(rows) = state.tables.get_mut(table) {
                for row in rows.iter_mut().filter(|r| Store::matches(r, cond)) {
                    for (col, value) in set {
                        row.insert(col.to_string(), value.clone());
                    }
                    affected += 1;
                }
            }
            ExecResult::new(affected)
        };
        async move { Outcome::Ok(result) }
    }

    fn delete(
        &self,
        _cx: &Cx,
        table: &'static str,
        cond: &[Cond],
        _tx: Option<TxToken>,
    ) -> impl Future<Output = Outcome<ExecResult, Error>> + Send {
        let result = {
            let mut state = self.state.lock().unwrap();
            let mut affected = 0;
            if let Some(rows) = state.tables.get_mut(table) {
                let before = rows.len();
                rows.retain(|r| !Store::matches(r, cond));
                affected = (before - rows.len()) as u64;
            }
            ExecResult::new(affected)
        };
        async move { Outcome::Ok(result) }
    }

    fn acquire_lock(
        &self,
        _cx: &Cx,
        table: &'static str,
        cond: &[Cond],
        _lock: RowLock,
        _wait: LockWait,
        _tx: Option<TxToken>,
    ) -> impl Future<Output = Outcome<ExecResult, Error>> + Send {
        let result = {
            let state = self.state.lock().unwrap();
            let matched = state
                .tables
                .get(table)
                .map_or(0, |rows| rows.iter().filter(|r| Store::matches(r, cond)).count());
            ExecResult::new(matched as u64)
        };
        async move { Outcome::Ok(result) }
    }

    fn begin(
        &self,
        _cx: &Cx,
        _parent: Option<TxToken>,
    ) -> impl Future<Output = Outcome<TxToken, Error>> + Send {
        let token = {
            let mut state = self.state.lock().unwrap();
            state.next_tx += 1;
            let token = TxToken(state.next_tx);
            let snapshot = state.tables.clone();
            state.journals.insert(token.0, snapshot);
            token
        };
        async move { Outcome::Ok(token) }
    }

    fn commit(&self, _cx: &Cx, tx: TxToken) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.state.lock().unwrap().journals.remove(&tx.0);
        async move { Outcome::Ok(()) }
    }

    fn rollback(&self, _cx: &Cx, tx: TxToken) -> impl Future<Output = Outcome<(), Error>> + Send {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(journal) = state.journals.remove(&tx.0) {
                state.tables = journal;
            }
        }
        async move { Outcome::Ok(()) }
    }
}

// ----------------------------------------------------------------------
// Entities
// ----------------------------------------------------------------------

struct Team {
    id: Option<i64>,
    name: String,
}

impl Entity for Team {
    const TABLE_NAME: &'static str = "team";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn fields() -> &'static [FieldMeta] {
        const FIELDS: &[FieldMeta] = &[
            FieldMeta::new("id", "id").primary_key().generated(),
            FieldMeta::new("name", "name"),
        ];
        FIELDS
    }

    fn relations() -> &'static [RelationMeta] {
        const RELATIONS: &[RelationMeta] = &[RelationMeta::new(
            "heroes",
            RelationKind::OneToMany,
            "hero",
            "team_id",
        )
        .cascade_remove()];
        RELATIONS
    }

    fn to_row(&self) -> Row {
        Row::new(
            vec!["id".to_string(), "name".to_string()],
            vec![self.id.into(), self.name.clone().into()],
        )
    }

    fn from_row(row: &Row) -> rowsync::Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
        })
    }

    fn apply_row(&mut self, row: &Row) -> rowsync::Result<()> {
        if row.contains_column("id") {
            self.id = row.get_named("id")?;
        }
        if row.contains_column("name") {
            self.name = row.get_named("name")?;
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

    fn relations() -> &'static [RelationMeta] {
        const RELATIONS: &[RelationMeta] =
            &[RelationMeta::new("team", RelationKind::ManyToOne, "team", "team_id")];
        RELATIONS
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

    fn from_row(row: &Row) -> rowsync::Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            team_id: row.get_named("team_id")?,
        })
    }

    fn apply_row(&mut self, row: &Row) -> rowsync::Result<()> {
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

/// Self-referencing entity: its foreign key dependency forms a cycle
/// of length one.
struct Employee {
    id: Option<i64>,
    name: String,
    manager_id: Option<i64>,
}

impl Entity for Employee {
    const TABLE_NAME: &'static str = "employee";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn fields() -> &'static [FieldMeta] {
        const FIELDS: &[FieldMeta] = &[
            FieldMeta::new("id", "id").primary_key().generated(),
            FieldMeta::new("name", "name"),
            FieldMeta::new("manager_id", "manager_id")
                .nullable()
                .foreign_key("employee.id"),
        ];
        FIELDS
    }

    fn relations() -> &'static [RelationMeta] {
        const RELATIONS: &[RelationMeta] = &[RelationMeta::new(
            "manager",
            RelationKind::ManyToOne,
            "employee",
            "manager_id",
        )];
        RELATIONS
    }

    fn to_row(&self) -> Row {
        Row::new(
            vec![
                "id".to_string(),
                "name".to_string(),
                "manager_id".to_string(),
            ],
            vec![
                self.id.into(),
                self.name.clone().into(),
                self.manager_id.into(),
            ],
        )
    }

    fn from_row(row: &Row) -> rowsync::Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            manager_id: row.get_named("manager_id")?,
        })
    }

    fn apply_row(&mut self, row: &Row) -> rowsync::Result<()> {
        if row.contains_column("id") {
            self.id = row.get_named("id")?;
        }
        if row.contains_column("name") {
            self.name = row.get_named("name")?;
        }
        if row.contains_column("manager_id") {
            self.manager_id = row.get_named("manager_id")?;
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

struct Account {
    id: Option<i64>,
    name: String,
    address: serde_json::Value,
    version: Option<i64>,
}

impl Entity for Account {
    const TABLE_NAME: &'static str = "account";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const VERSION_COLUMN: Option<&'static str> = Some("version");

    fn fields() -> &'static [FieldMeta] {
        const FIELDS: &[FieldMeta] = &[
            FieldMeta::new("id", "id").primary_key().generated(),
            FieldMeta::new("name", "name"),
            FieldMeta::new("address", "address").composite(),
            FieldMeta::new("version", "version").version().nullable(),
        ];
        FIELDS
    }

    fn to_row(&self) -> Row {
        Row::new(
            vec![
                "id".to_string(),
                "name".to_string(),
                "address".to_string(),
                "version".to_string(),
            ],
            vec![
                self.id.into(),
                self.name.clone().into(),
                Value::Json(self.address.clone()),
                self.version.into(),
            ],
        )
    }

    fn from_row(row: &Row) -> rowsync::Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            address: row.get_named("address")?,
            version: row.get_named("version")?,
        })
    }

    fn apply_row(&mut self, row: &Row) -> rowsync::Result<()> {
        if row.contains_column("id") {
            self.id = row.get_named("id")?;
        }
        if row.contains_column("name") {
            self.name = row.get_named("name")?;
        }
        if row.contains_column("address") {
            self.address = row.get_named("address")?;
        }
        if row.contains_column("version") {
            self.version = row.get_named("version")?;
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

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

#[test]
fn full_lifecycle_create_update_remove() {
    let driver = MemoryDriver::new()
        .auto_key("team", "id")
        .auto_key("hero", "id");
    let store = driver.clone();
    let mut ctx = Context::new(driver);
    let cx = Cx::for_testing();

    run(async {
        let team = ctx.persist(Team {
            id: None,
            name: "Avengers".to_string(),
        });
        let hero = ctx.persist(Hero {
            id: None,
            name: "Iron Man".to_string(),
            team_id: None,
        });
        ctx.link(&hero, "team", &team).unwrap();

        let report = unwrap_outcome(ctx.flush(&cx).await);
        assert_eq!(report.created, 2);
        assert_eq!(store.row_count("team"), 1);
        assert_eq!(store.row_count("hero"), 1);

        let team_id = team.read().id.expect("generated team id");
        assert_eq!(
            store.value_of("hero", &[("name", "Iron Man".into())], "team_id"),
            Some(Value::BigInt(team_id))
        );

        // Mutate and re-flush: only the changed row is written.
        hero.write().name = "Tony Stark".to_string();
        let report = unwrap_outcome(ctx.flush(&cx).await);
        assert_eq!(report.updated, 1);
        assert_eq!(report.created, 0);
        assert_eq!(
            store.value_of("hero", &[("id", hero.read().id.into())], "name"),
            Some(Value::Text("Tony Stark".to_string()))
        );

        // Removing the team takes its heroes with it.
        ctx.remove(&team).unwrap();
        let report = unwrap_outcome(ctx.flush(&cx).await);
        assert_eq!(report.deleted, 2);
        assert_eq!(store.row_count("team"), 0);
        assert_eq!(store.row_count("hero"), 0);
    });
}

#[test]
fn self_referencing_cycle_is_split() {
    let driver = MemoryDriver::new().auto_key("employee", "id");
    let store = driver.clone();
    let mut ctx = Context::new(driver);
    let cx = Cx::for_testing();

    run(async {
        let alice = ctx.persist(Employee {
            id: None,
            name: "Alice".to_string(),
            manager_id: None,
        });
        let bob = ctx.persist(Employee {
            id: None,
            name: "Bob".to_string(),
            manager_id: None,
        });
        // Mutual management: unsatisfiable in one pass without
        // deferring the foreign keys.
        ctx.link(&alice, "manager", &bob).unwrap();
        ctx.link(&bob, "manager", &alice).unwrap();

        let report = unwrap_outcome(ctx.flush(&cx).await);
        assert_eq!(report.created, 2);
        assert_eq!(store.row_count("employee"), 2);

        let alice_id = alice.read().id.expect("generated id");
        let bob_id = bob.read().id.expect("generated id");
        assert_eq!(
            store.value_of("employee", &[("id", alice_id.into())], "manager_id"),
            Some(Value::BigInt(bob_id))
        );
        assert_eq!(
            store.value_of("employee", &[("id", bob_id.into())], "manager_id"),
            Some(Value::BigInt(alice_id))
        );

        // Nothing left dirty after the deferred patches settled.
        let report = unwrap_outcome(ctx.flush(&cx).await);
        assert!(report.is_empty());
    });
}

#[test]
fn stale_version_loses_and_store_rolls_back() {
    let driver = MemoryDriver::new().auto_key("account", "id");
    let store = driver.clone();
    let cx = Cx::for_testing();

    run(async {
        store.seed(
            "account",
            vec![
                ("id", Value::BigInt(1)),
                ("name", "acme".into()),
                ("address", Value::Json(json!({"city": "Oslo"}))),
                ("version", Value::BigInt(1)),
            ],
        );

        // Two independent contexts load the same row.
        let mut first = Context::new(store.clone());
        let mut second = Context::new(store.clone());
        let a = unwrap_outcome(first.get::<Account>(&cx, &[Value::BigInt(1)]).await)
            .expect("seeded row");
        let b = unwrap_outcome(second.get::<Account>(&cx, &[Value::BigInt(1)]).await)
            .expect("seeded row");

        a.write().name = "acme prime".to_string();
        unwrap_outcome(first.flush(&cx).await);
        assert_eq!(
            store.value_of("account", &[("id", Value::BigInt(1))], "version"),
            Some(Value::BigInt(2))
        );

        // The second context still expects version 1 and must lose.
        b.write().name = "acme classic".to_string();
        let err = expect_err(second.flush(&cx).await);
        assert!(err.is_conflict());

        // The winner's write survived the loser's rollback.
        assert_eq!(
            store.value_of("account", &[("id", Value::BigInt(1))], "name"),
            Some(Value::Text("acme prime".to_string()))
        );
    });
}

#[test]
fn commit_flush_mode_defers_writes_to_commit() {
    let driver = MemoryDriver::new().auto_key("team", "id");
    let store = driver.clone();
    let config = ContextConfig {
        flush_mode: FlushMode::Commit,
        ..ContextConfig::default()
    };
    let mut ctx = Context::with_config(driver, config);
    let cx = Cx::for_testing();

    run(async {
        ctx.persist(Team {
            id: None,
            name: "Avengers".to_string(),
        });

        // Reads do not force the pending insert out.
        let found = unwrap_outcome(ctx.find::<Hero>(&cx, &[]).await);
        assert!(found.is_empty());
        assert_eq!(store.row_count("team"), 0);

        unwrap_outcome(ctx.begin(&cx).await);
        let report = unwrap_outcome(ctx.commit(&cx).await);
        assert_eq!(report.created, 1);
        assert_eq!(store.row_count("team"), 1);
    });
}

#[test]
fn forked_contexts_load_independently_and_merge() {
    let driver = MemoryDriver::new();
    let store = driver.clone();
    let cx = Cx::for_testing();

    run(async {
        store.seed(
            "hero",
            vec![
                ("id", Value::BigInt(1)),
                ("name", "a".into()),
                ("team_id", Value::Null),
            ],
        );
        store.seed(
            "hero",
            vec![
                ("id", Value::BigInt(2)),
                ("name", "b".into()),
                ("team_id", Value::Null),
            ],
        );

        let mut ctx = Context::new(driver);
        let mut fork = ctx.fork();

        let ours = unwrap_outcome(ctx.get::<Hero>(&cx, &[Value::BigInt(1)]).await).unwrap();
        let theirs = unwrap_outcome(fork.get::<Hero>(&cx, &[Value::BigInt(2)]).await).unwrap();
        theirs.write().name = "b loaded elsewhere".to_string();

        ctx.merge(fork);

        // Both identities now live in the parent.
        let one = unwrap_outcome(ctx.get::<Hero>(&cx, &[Value::BigInt(1)]).await).unwrap();
        let two = unwrap_outcome(ctx.get::<Hero>(&cx, &[Value::BigInt(2)]).await).unwrap();
        assert!(one.ptr_eq(&ours));
        assert!(two.ptr_eq(&theirs));

        // The fork's dirty state flushes through the parent.
        let report = unwrap_outcome(ctx.flush(&cx).await);
        assert_eq!(report.updated, 1);
        assert_eq!(
            store.value_of("hero", &[("id", Value::BigInt(2))], "name"),
            Some(Value::Text("b loaded elsewhere".to_string()))
        );
    });
}

#[test]
fn refresh_discards_unflushed_changes() {
    let driver = MemoryDriver::new();
    let store = driver.clone();
    let mut ctx = Context::new(driver);
    let cx = Cx::for_testing();

    run(async {
        store.seed(
            "hero",
            vec![
                ("id", Value::BigInt(1)),
                ("name", "a".into()),
                ("team_id", Value::Null),
            ],
        );

        let hero = unwrap_outcome(ctx.get::<Hero>(&cx, &[Value::BigInt(1)]).await).unwrap();
        hero.write().name = "scribbled over".to_string();
        unwrap_outcome(ctx.refresh(&cx, &hero).await);

        assert_eq!(hero.read().name, "a");
        let report = unwrap_outcome(ctx.flush(&cx).await);
        assert!(report.is_empty());
    });
}
