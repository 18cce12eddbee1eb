//! The persistent package cache, backed by an embedded SQLite database.
//!
//! Schema:
//!
//! ```text
//! packages(id, source, name, version)            unique (source, name, version)
//! dependencies(from_package_id, source, package, alias, spec)
//! resolutions(package, spec, source)             the resolved set
//! updated(package, version, source, resolver)    the updated-by map
//! ```
//!
//! Every write commits immediately. The connection is opened lazily and
//! shared by reference-counted contexts (`enter`/`exit`); the physical
//! connection closes when the outermost context exits.

use crate::{PackageCache, shrink_guard};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tangle_core::{Dependency, Error, Package, Result, Version, VersionSpec};
use tracing::warn;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS packages (
    id      INTEGER PRIMARY KEY,
    source  TEXT NOT NULL,
    name    TEXT NOT NULL,
    version TEXT NOT NULL,
    UNIQUE (source, name, version)
);
CREATE TABLE IF NOT EXISTS dependencies (
    id              INTEGER PRIMARY KEY,
    from_package_id INTEGER NOT NULL REFERENCES packages (id),
    source          TEXT NOT NULL,
    package         TEXT NOT NULL,
    alias           TEXT,
    spec            TEXT,
    UNIQUE (from_package_id, package, spec)
);
CREATE TABLE IF NOT EXISTS resolutions (
    id      INTEGER PRIMARY KEY,
    package TEXT NOT NULL,
    spec    TEXT,
    source  TEXT,
    UNIQUE (package, spec, source)
);
CREATE TABLE IF NOT EXISTS updated (
    id       INTEGER PRIMARY KEY,
    package  TEXT NOT NULL,
    version  TEXT,
    source   TEXT,
    resolver TEXT,
    UNIQUE (package, version, source, resolver)
);
";

#[derive(Debug, Default)]
struct ConnectionState {
    connection: Option<Connection>,
    entries: usize,
}

/// SQLite-backed implementation of [`PackageCache`].
#[derive(Debug)]
pub struct SqlitePackageCache {
    location: Location,
    state: Mutex<ConnectionState>,
}

#[derive(Debug, Clone)]
enum Location {
    Memory,
    File(PathBuf),
}

impl SqlitePackageCache {
    /// Open a cache at `path`, or fully in memory for `":memory:"`.
    ///
    /// The database file is created (along with parent directories) on the
    /// first actual access, not here.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let location = if path.as_os_str() == ":memory:" {
            Location::Memory
        } else {
            Location::File(path.to_path_buf())
        };
        Self {
            location,
            state: Mutex::new(ConnectionState::default()),
        }
    }

    fn open_connection(&self) -> Result<Connection> {
        let connection = match &self.location {
            Location::Memory => Connection::open_in_memory(),
            Location::File(path) => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
                }
                Connection::open(path)
            }
        }
        .map_err(|e| Error::Database {
            message: e.to_string(),
        })?;
        connection
            .execute_batch(SCHEMA)
            .map_err(|e| Error::Database {
                message: e.to_string(),
            })?;
        self.check_schema(&connection)?;
        Ok(connection)
    }

    /// An older database may carry these tables with different columns;
    /// probing the expected columns distinguishes "fresh" from "incompatible".
    fn check_schema(&self, connection: &Connection) -> Result<()> {
        let probes = [
            "SELECT source, name, version FROM packages LIMIT 1",
            "SELECT from_package_id, source, package, alias, spec FROM dependencies LIMIT 1",
            "SELECT package, spec, source FROM resolutions LIMIT 1",
            "SELECT package, version, source, resolver FROM updated LIMIT 1",
        ];
        for probe in probes {
            if connection.prepare(probe).is_err() {
                let path = match &self.location {
                    Location::Memory => PathBuf::from(":memory:"),
                    Location::File(path) => path.clone(),
                };
                return Err(Error::SchemaMismatch { path });
            }
        }
        Ok(())
    }

    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        if state.connection.is_none() {
            state.connection = Some(self.open_connection()?);
        }
        let connection = state.connection.as_ref().unwrap_or_else(|| unreachable!());
        f(connection).map_err(|e| Error::Database {
            message: e.to_string(),
        })
    }

    /// Like [`Self::with_connection`], but swallows database errors with a
    /// warning. Used for query paths whose trait signature is infallible.
    fn query<T: Default>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> T {
        match self.with_connection(f) {
            Ok(value) => value,
            Err(error) => {
                warn!(%error, "package database query failed");
                T::default()
            }
        }
    }

    fn load_package(connection: &Connection, id: i64) -> rusqlite::Result<Package> {
        let (source, name, version) = connection.query_row(
            "SELECT source, name, version FROM packages WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )?;
        let version = Version::parse(&version).unwrap_or_else(|_| Version::raw(version));
        let package = Package::new(source, name, version);

        let mut statement = connection.prepare(
            "SELECT source, package, alias, spec FROM dependencies WHERE from_package_id = ?1",
        )?;
        let rows = statement.query_map(params![id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;
        let mut dependencies = Vec::new();
        for row in rows {
            let (dep_source, dep_package, alias, spec) = row?;
            let spec = spec
                .as_deref()
                .map(|s| VersionSpec::parse(s).unwrap_or_default())
                .unwrap_or_default();
            let mut dependency = Dependency::with_spec(dep_source, dep_package, spec);
            dependency.alias = alias;
            dependencies.push(dependency);
        }
        Ok(package.update_dependencies(dependencies))
    }

    fn package_id(
        connection: &Connection,
        package: &Package,
    ) -> rusqlite::Result<Option<i64>> {
        connection
            .query_row(
                "SELECT id FROM packages WHERE source = ?1 AND name = ?2 AND version = ?3",
                params![package.source, package.name, package.version.to_string()],
                |row| row.get(0),
            )
            .optional()
    }

    fn insert_dependencies(
        connection: &Connection,
        package_id: i64,
        package: &Package,
    ) -> rusqlite::Result<()> {
        let mut statement = connection.prepare(
            "INSERT OR IGNORE INTO dependencies (from_package_id, source, package, alias, spec) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for dep in &package.dependencies {
            statement.execute(params![
                package_id,
                dep.source,
                dep.package,
                dep.alias,
                dep.spec.to_string()
            ])?;
        }
        Ok(())
    }
}

impl PackageCache for SqlitePackageCache {
    fn len(&self) -> usize {
        self.query(|connection| {
            connection.query_row("SELECT COUNT(*) FROM packages", [], |row| {
                row.get::<_, i64>(0)
            })
        }) as usize
    }

    fn packages(&self) -> Vec<Package> {
        self.query(|connection| {
            let mut statement = connection.prepare("SELECT id FROM packages ORDER BY id")?;
            let ids: Vec<i64> = statement
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            ids.into_iter()
                .map(|id| Self::load_package(connection, id))
                .collect()
        })
    }

    fn add(&self, package: &Package) -> Result<()> {
        // the shrink guard needs the existing entry before we touch rows
        let existing = self.with_connection(|connection| {
            match Self::package_id(connection, package)? {
                Some(id) => Ok(Some((id, Self::load_package(connection, id)?))),
                None => Ok(None),
            }
        })?;

        if let Some((_, existing_package)) = &existing {
            shrink_guard(existing_package, package)?;
        }

        self.with_connection(|connection| {
            let id = match existing {
                Some((id, _)) => id,
                None => {
                    connection.execute(
                        "INSERT INTO packages (source, name, version) VALUES (?1, ?2, ?3)",
                        params![package.source, package.name, package.version.to_string()],
                    )?;
                    connection.last_insert_rowid()
                }
            };
            Self::insert_dependencies(connection, id, package)
        })
    }

    fn match_dependency(&self, dependency: &Dependency) -> Vec<Package> {
        self.query(|connection| {
            let mut statement = connection
                .prepare("SELECT id, version FROM packages WHERE source = ?1 AND name = ?2")?;
            let rows: Vec<(i64, String)> = statement
                .query_map(params![dependency.source, dependency.package], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<_>>()?;
            rows.into_iter()
                .filter(|(_, version)| {
                    let version =
                        Version::parse(version).unwrap_or_else(|_| Version::raw(version.clone()));
                    dependency.spec.matches(&version)
                })
                .map(|(id, _)| Self::load_package(connection, id))
                .collect()
        })
    }

    fn was_resolved(&self, dependency: &Dependency) -> bool {
        self.query(|connection| {
            connection.query_row(
                "SELECT EXISTS ( \
                     SELECT 1 FROM resolutions \
                     WHERE package = ?1 AND spec = ?2 AND source = ?3)",
                params![
                    dependency.package,
                    dependency.spec.to_string(),
                    dependency.source
                ],
                |row| row.get(0),
            )
        })
    }

    fn set_resolved(&self, dependency: &Dependency) {
        self.query(|connection| {
            connection.execute(
                "INSERT OR IGNORE INTO resolutions (package, spec, source) VALUES (?1, ?2, ?3)",
                params![
                    dependency.package,
                    dependency.spec.to_string(),
                    dependency.source
                ],
            )
        });
    }

    fn was_updated(&self, package: &Package, resolver: &str) -> bool {
        if package.source == resolver {
            return true;
        }
        self.query(|connection| {
            connection.query_row(
                "SELECT EXISTS ( \
                     SELECT 1 FROM updated \
                     WHERE package = ?1 AND version = ?2 AND source = ?3 AND resolver = ?4)",
                params![
                    package.name,
                    package.version.to_string(),
                    package.source,
                    resolver
                ],
                |row| row.get(0),
            )
        })
    }

    fn set_updated(&self, package: &Package, resolver: &str) {
        self.query(|connection| {
            connection.execute(
                "INSERT OR IGNORE INTO updated (package, version, source, resolver) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    package.name,
                    package.version.to_string(),
                    package.source,
                    resolver
                ],
            )
        });
    }

    fn updated_by(&self, package: &Package) -> BTreeSet<String> {
        self.query(|connection| {
            let mut statement = connection.prepare(
                "SELECT resolver FROM updated \
                 WHERE package = ?1 AND version = ?2 AND source = ?3",
            )?;
            let rows = statement.query_map(
                params![package.name, package.version.to_string(), package.source],
                |row| row.get::<_, String>(0),
            )?;
            rows.collect()
        })
    }

    fn package_full_names(&self) -> BTreeSet<String> {
        self.query(|connection| {
            let mut statement =
                connection.prepare("SELECT DISTINCT source, name FROM packages")?;
            let rows = statement.query_map([], |row| {
                Ok(format!(
                    "{}:{}",
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?
                ))
            })?;
            rows.collect()
        })
    }

    fn package_versions(&self, full_name: &str) -> Vec<Package> {
        let Some((source, name)) = full_name.split_once(':') else {
            return Vec::new();
        };
        self.query(|connection| {
            let mut statement =
                connection.prepare("SELECT id FROM packages WHERE source = ?1 AND name = ?2")?;
            let ids: Vec<i64> = statement
                .query_map(params![source, name], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            ids.into_iter()
                .map(|id| Self::load_package(connection, id))
                .collect()
        })
    }

    fn enter(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.connection.is_none() {
            // drop the lock-held borrow before reopening through &self
            drop(state);
            let connection = self.open_connection()?;
            state = self.state.lock();
            if state.connection.is_none() {
                state.connection = Some(connection);
            }
        }
        state.entries += 1;
        Ok(())
    }

    fn exit(&self) {
        let mut state = self.state.lock();
        state.entries = state.entries.saturating_sub(1);
        if state.entries == 0 {
            state.connection = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheSession;
    use pretty_assertions::assert_eq;

    fn pkg(desc: &str) -> Package {
        Package::from_string(desc).unwrap()
    }

    #[test]
    fn round_trips_packages() {
        let cache = SqlitePackageCache::new(":memory:");
        let _session = CacheSession::enter(&cache).unwrap();

        let package = pkg("ubuntu:libc6@2.31[ubuntu:somepkg@<0.1.0,ubuntu:otherpkg@=2.1.0]");
        cache.add(&package).unwrap();
        assert_eq!(cache.len(), 1);

        let loaded = cache.match_str("ubuntu:libc6@2.31").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], package);
        assert_eq!(loaded[0].dependencies, package.dependencies);
    }

    #[test]
    fn add_unions_and_guards_shrink() {
        let cache = SqlitePackageCache::new(":memory:");
        let _session = CacheSession::enter(&cache).unwrap();

        cache.add(&pkg("pip:a@1.0.0[pip:b@*]")).unwrap();
        cache.add(&pkg("pip:a@1.0.0[pip:c@*]")).unwrap();
        let stored = &cache.match_str("pip:a@1.0.0").unwrap()[0];
        assert_eq!(stored.dependencies.len(), 2);

        let err = cache.add(&pkg("pip:a@1.0.0[pip:b@*]")).unwrap_err();
        assert!(matches!(err, Error::CacheConflict { .. }));
    }

    #[test]
    fn resolution_and_update_marks_persist() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("cache.sqlite");

        {
            let cache = SqlitePackageCache::new(&db);
            let _session = CacheSession::enter(&cache).unwrap();
            let dep = Dependency::from_string("pip:cvedb@<0.2.1").unwrap();
            cache.set_resolved(&dep);
            cache.set_resolved(&dep);
            let package = pkg("pip:cvedb@0.2.0");
            cache.add(&package).unwrap();
            cache.set_updated(&package, "ubuntu");
        }

        let cache = SqlitePackageCache::new(&db);
        let _session = CacheSession::enter(&cache).unwrap();
        let dep = Dependency::from_string("pip:cvedb@<0.2.1").unwrap();
        assert!(cache.was_resolved(&dep));
        assert!(!cache.was_resolved(&Dependency::new("pip", "cvedb")));

        let package = pkg("pip:cvedb@0.2.0");
        assert!(cache.was_updated(&package, "ubuntu"));
        assert!(cache.was_updated(&package, "pip"), "own source counts");
        assert_eq!(
            cache.updated_by(&package),
            BTreeSet::from(["ubuntu".to_string()])
        );
    }

    #[test]
    fn nested_sessions_share_one_connection() {
        let cache = SqlitePackageCache::new(":memory:");
        let outer = CacheSession::enter(&cache).unwrap();
        cache.add(&pkg("pip:a@1.0.0")).unwrap();
        {
            let _inner = CacheSession::enter(&cache).unwrap();
            assert_eq!(cache.len(), 1, "inner context sees outer's writes");
        }
        // inner exit must not have closed the shared in-memory connection
        assert_eq!(cache.len(), 1);
        drop(outer);
    }

    #[test]
    fn incompatible_schema_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("cache.sqlite");
        let connection = Connection::open(&db).unwrap();
        connection
            .execute_batch("CREATE TABLE packages (id INTEGER PRIMARY KEY, blob TEXT);")
            .unwrap();
        drop(connection);

        let cache = SqlitePackageCache::new(&db);
        let err = cache.enter().unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { .. }));
    }
}
