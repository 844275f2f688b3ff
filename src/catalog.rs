use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::path::Path;

/// One row of a `search` query.
pub struct SearchRow {
    pub pkgstem: String,
    pub comment: String,
    pub fullpkgpath: String,
}

/// The full row returned by `details`.
pub struct PortDetails {
    pub fullpkgpath: String,
    pub pkgstem: String,
    pub comment: String,
    pub pkgname: String,
    pub descr: String,
    pub maintainer_email: String,
    pub readme: Option<String>,
    pub homepage: String,
}

const SEARCH_SQL: &str = "
    select webpkg_fts.pkgstem, webpkg_fts.comment, paths.fullpkgpath
    from webpkg_fts
    join _ports p on p.fullpkgpath = webpkg_fts.id
    join _paths paths on paths.id = webpkg_fts.id
    where webpkg_fts match ?1
    order by bm25(webpkg_fts)
";

const DETAILS_SQL: &str = "
    select p.fullpkgpath, pp.pkgstem, pp.comment, pp.pkgname,
           d.value, e.value, r.value, pp.homepage
    from _paths p
    join _descr d on d.fullpkgpath = p.id
    join _ports pp on pp.fullpkgpath = p.id
    join _email e on e.keyref = pp.maintainer
    left join _readme r on r.fullpkgpath = p.id
    where p.fullpkgpath = ?1
";

const CATEGORIES_SQL: &str = "select distinct value from categories order by value";

const PATHS_IN_CATEGORY_SQL: &str =
    "select fullpkgpath from categories where value = ?1 order by fullpkgpath";

/// Read-only handle onto the ports catalog database, holding the four
/// prepared queries described in §4.A.
///
/// Each query method binds, steps to completion and resets the underlying
/// statement before returning — in both the success and error path, per
/// §7's "Query failure" row — so statements are safe to reuse across
/// requests even though they are not reentrant.
pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Opens `path` read-only. Preparation failure (a missing table, a
    /// corrupt file) is fatal at startup — the four statements below are
    /// prepared eagerly just to surface that failure immediately, then
    /// dropped; each query method re-prepares (via the statement cache)
    /// per call, which keeps `Catalog` free of self-referential borrows.
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        conn.prepare(SEARCH_SQL)?;
        conn.prepare(DETAILS_SQL)?;
        conn.prepare(CATEGORIES_SQL)?;
        conn.prepare(PATHS_IN_CATEGORY_SQL)?;
        Ok(Catalog { conn })
    }

    /// Opens an in-memory store for tests, seeded with a miniature schema
    /// matching the joins above.
    #[cfg(test)]
    pub fn open_in_memory_for_test() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "
            create table _paths (id integer primary key, fullpkgpath text);
            create table _ports (fullpkgpath integer, pkgstem text, comment text, pkgname text, maintainer integer, homepage text);
            create table _descr (fullpkgpath integer, value text);
            create table _email (keyref integer, value text);
            create table _readme (fullpkgpath integer, value text);
            create table categories (value text, fullpkgpath text);
            create virtual table webpkg_fts using fts4(id, pkgstem, comment);
            ",
        )?;
        Ok(Catalog { conn })
    }

    #[cfg(test)]
    pub fn raw_connection(&self) -> &Connection {
        &self.conn
    }

    // Each method below uses `prepare_cached`: the statement is checked out of
    // the connection's cache, stepped to completion, and its bindings are
    // cleared before it is returned to the cache on drop. That clear-on-drop
    // is the `reset` the store's contract (§4.A, §7) requires in both the
    // success and error path — it happens whether `query_map`/`query_row`
    // above returns `Ok` or `Err`, since it runs unconditionally at the end
    // of the statement's scope.

    pub fn search(&self, match_expression: &str) -> rusqlite::Result<Vec<SearchRow>> {
        let mut stmt = self.conn.prepare_cached(SEARCH_SQL)?;
        let rows = stmt.query_map([match_expression], |row| {
            Ok(SearchRow {
                pkgstem: row.get(0)?,
                comment: row.get(1)?,
                fullpkgpath: row.get(2)?,
            })
        })?;
        let result = rows.collect::<rusqlite::Result<Vec<_>>>();
        stmt.clear_bindings();
        result
    }

    pub fn details(&self, fullpkgpath: &str) -> rusqlite::Result<Option<PortDetails>> {
        let mut stmt = self.conn.prepare_cached(DETAILS_SQL)?;
        let result = stmt
            .query_row([fullpkgpath], |row| {
                Ok(PortDetails {
                    fullpkgpath: row.get(0)?,
                    pkgstem: row.get(1)?,
                    comment: row.get(2)?,
                    pkgname: row.get(3)?,
                    descr: row.get(4)?,
                    maintainer_email: row.get(5)?,
                    readme: row.get(6)?,
                    homepage: row.get(7)?,
                })
            })
            .optional();
        stmt.clear_bindings();
        result
    }

    pub fn categories(&self) -> rusqlite::Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(CATEGORIES_SQL)?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let result = rows.collect::<rusqlite::Result<Vec<String>>>();
        stmt.clear_bindings();
        result
    }

    pub fn paths_in_category(&self, category: &str) -> rusqlite::Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(PATHS_IN_CATEGORY_SQL)?;
        let rows = stmt.query_map([category], |row| row.get(0))?;
        let result = rows.collect::<rusqlite::Result<Vec<String>>>();
        stmt.clear_bindings();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(catalog: &Catalog) {
        catalog
            .conn
            .execute_batch(
                "
                insert into _paths (id, fullpkgpath) values (1, 'editors/vim');
                insert into _ports (fullpkgpath, pkgstem, comment, pkgname, maintainer, homepage)
                    values (1, 'vim', 'vi IMproved', 'vim-9.0', 1, 'https://www.vim.org/');
                insert into _descr (fullpkgpath, value) values (1, 'Vim is a text editor.');
                insert into _email (keyref, value) values (1, 'Jane Doe <jane@example.org>');
                insert into categories (value, fullpkgpath) values ('editors', 'editors/vim');
                insert into webpkg_fts (id, pkgstem, comment) values (1, 'vim', 'vi IMproved');
                ",
            )
            .unwrap();
    }

    #[test]
    fn details_roundtrip() {
        let catalog = Catalog::open_in_memory_for_test().unwrap();
        seed(&catalog);

        let details = catalog.details("editors/vim").unwrap().unwrap();
        assert_eq!(details.pkgstem, "vim");
        assert_eq!(details.pkgname, "vim-9.0");
        assert_eq!(details.readme, None);
    }

    #[test]
    fn details_missing_returns_none() {
        let catalog = Catalog::open_in_memory_for_test().unwrap();
        seed(&catalog);
        assert!(catalog.details("editors/nonexistent").unwrap().is_none());
    }

    #[test]
    fn categories_are_distinct_and_sorted() {
        let catalog = Catalog::open_in_memory_for_test().unwrap();
        seed(&catalog);
        catalog
            .conn
            .execute(
                "insert into categories (value, fullpkgpath) values ('editors', 'editors/vim')",
                [],
            )
            .unwrap();
        assert_eq!(catalog.categories().unwrap(), vec!["editors".to_string()]);
    }

    #[test]
    fn paths_in_category() {
        let catalog = Catalog::open_in_memory_for_test().unwrap();
        seed(&catalog);
        assert_eq!(
            catalog.paths_in_category("editors").unwrap(),
            vec!["editors/vim".to_string()]
        );
        assert!(catalog.paths_in_category("games").unwrap().is_empty());
    }

    #[test]
    fn search_orders_by_relevance() {
        let catalog = Catalog::open_in_memory_for_test().unwrap();
        seed(&catalog);
        let rows = catalog.search("\"vim\"").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fullpkgpath, "editors/vim");
    }
}
