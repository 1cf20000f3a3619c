//! Cached schema metadata.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use crate::{
    database::{quote_identifier, ColumnInfo, SqlDatabase},
    errors::{Error, Result},
    tools::value_to_cell,
};

/// Default number of sample rows shown per table in [`SchemaCatalog::table_info`].
pub const DEFAULT_SAMPLE_ROWS: usize = 3;

const MAX_SAMPLE_CELL_CHARS: usize = 100;

/// Immutable table -> columns map captured at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaSnapshot {
    tables: BTreeMap<String, Vec<ColumnInfo>>,
}

impl SchemaSnapshot {
    pub fn new(tables: BTreeMap<String, Vec<ColumnInfo>>) -> Self {
        Self { tables }
    }

    /// Table names in sorted order.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn columns(&self, table: &str) -> Option<&[ColumnInfo]> {
        let name = self.resolve(table)?;
        self.tables.get(name).map(Vec::as_slice)
    }

    /// Resolves a model-supplied table name to the catalog's spelling.
    ///
    /// Exact matches win; otherwise the name is compared case-insensitively
    /// after stripping surrounding quotes, backticks or brackets.
    pub fn resolve(&self, table: &str) -> Option<&str> {
        if let Some((name, _)) = self.tables.get_key_value(table) {
            return Some(name.as_str());
        }
        let wanted = unquote(table.trim());
        if let Some((name, _)) = self.tables.get_key_value(wanted) {
            return Some(name.as_str());
        }
        self.tables
            .keys()
            .find(|name| name.eq_ignore_ascii_case(wanted))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[ColumnInfo])> {
        self.tables
            .iter()
            .map(|(name, columns)| (name.as_str(), columns.as_slice()))
    }
}

fn unquote(name: &str) -> &str {
    for (open, close) in [('"', '"'), ('`', '`'), ('\'', '\''), ('[', ']')] {
        if name.len() >= 2 && name.starts_with(open) && name.ends_with(close) {
            return &name[1..name.len() - 1];
        }
    }
    name
}

#[derive(Debug, Clone)]
pub struct CatalogOptions {
    /// When set, only these tables (matched case-insensitively) are visible.
    pub include_tables: Option<Vec<String>>,
    /// Sample rows appended to each table in [`SchemaCatalog::table_info`].
    pub sample_rows: usize,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        Self {
            include_tables: None,
            sample_rows: DEFAULT_SAMPLE_ROWS,
        }
    }
}

impl CatalogOptions {
    pub fn with_include_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_tables = Some(tables.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_sample_rows(mut self, sample_rows: usize) -> Self {
        self.sample_rows = sample_rows;
        self
    }
}

/// Lazily built, shareable schema cache over a [`SqlDatabase`].
///
/// The snapshot is computed on first access and reused until
/// [`refresh`](Self::refresh). The lock only guards swapping the cached `Arc`;
/// it is never held while the database is queried.
pub struct SchemaCatalog {
    db: Arc<dyn SqlDatabase>,
    options: CatalogOptions,
    cached: RwLock<Option<Arc<SchemaSnapshot>>>,
}

impl std::fmt::Debug for SchemaCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaCatalog")
            .field("backend", &self.db.backend())
            .field("options", &self.options)
            .field("cached", &self.cached_snapshot().is_some())
            .finish()
    }
}

impl SchemaCatalog {
    pub fn new(db: Arc<dyn SqlDatabase>) -> Self {
        Self::with_options(db, CatalogOptions::default())
    }

    pub fn with_options(db: Arc<dyn SqlDatabase>, options: CatalogOptions) -> Self {
        Self {
            db,
            options,
            cached: RwLock::new(None),
        }
    }

    pub fn database(&self) -> &Arc<dyn SqlDatabase> {
        &self.db
    }

    pub fn options(&self) -> &CatalogOptions {
        &self.options
    }

    /// Returns the cached snapshot, building it on first use.
    pub async fn snapshot(&self) -> Result<Arc<SchemaSnapshot>> {
        if let Some(snapshot) = self.cached_snapshot() {
            return Ok(snapshot);
        }
        let built = Arc::new(self.build().await?);
        // Another task may have finished first; keep whichever landed first so
        // every caller sees the same Arc.
        let mut slot = self.cached.write().unwrap_or_else(|p| p.into_inner());
        Ok(Arc::clone(slot.get_or_insert(built)))
    }

    /// Rebuilds the snapshot from the database and replaces the cache.
    pub async fn refresh(&self) -> Result<Arc<SchemaSnapshot>> {
        let built = Arc::new(self.build().await?);
        *self.cached.write().unwrap_or_else(|p| p.into_inner()) = Some(Arc::clone(&built));
        tracing::debug!(tables = built.len(), "schema catalog refreshed");
        Ok(built)
    }

    /// Columns of `table`, or [`Error::UnknownTable`] listing what exists.
    pub async fn describe(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let snapshot = self.snapshot().await?;
        snapshot
            .columns(table)
            .map(<[ColumnInfo]>::to_vec)
            .ok_or_else(|| Error::UnknownTable {
                table: table.trim().to_string(),
                available: snapshot.table_names(),
            })
    }

    /// Renders a `CREATE TABLE` style block per table followed by sample rows.
    ///
    /// An empty `tables` slice renders every table in the snapshot. Unknown
    /// names fail with [`Error::UnknownTable`]; sample rows that cannot be
    /// fetched are left out.
    pub async fn table_info(&self, tables: &[String]) -> Result<String> {
        let snapshot = self.snapshot().await?;
        let names: Vec<String> = if tables.is_empty() {
            snapshot.table_names()
        } else {
            tables
                .iter()
                .map(|t| {
                    snapshot
                        .resolve(t)
                        .map(str::to_string)
                        .ok_or_else(|| Error::UnknownTable {
                            table: t.trim().to_string(),
                            available: snapshot.table_names(),
                        })
                })
                .collect::<Result<_>>()?
        };

        let mut blocks = Vec::with_capacity(names.len());
        for name in &names {
            let columns = snapshot.columns(name).unwrap_or_default();
            let mut block = create_table_block(name, columns);
            if self.options.sample_rows > 0 {
                if let Some(samples) = self.sample_rows_block(name).await {
                    block.push_str("\n\n");
                    block.push_str(&samples);
                }
            }
            blocks.push(block);
        }
        Ok(blocks.join("\n\n"))
    }

    fn cached_snapshot(&self) -> Option<Arc<SchemaSnapshot>> {
        self.cached
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(Arc::clone)
    }

    async fn build(&self) -> Result<SchemaSnapshot> {
        let mut names = self
            .db
            .list_tables()
            .await
            .map_err(|err| Error::CatalogUnavailable(err.to_string()))?;

        if let Some(include) = &self.options.include_tables {
            names.retain(|name| include.iter().any(|i| i.eq_ignore_ascii_case(name)));
        }

        let mut tables = BTreeMap::new();
        for name in names {
            let columns = self
                .db
                .table_columns(&name)
                .await
                .map_err(|err| Error::CatalogUnavailable(err.to_string()))?;
            tables.insert(name, columns);
        }
        tracing::debug!(
            backend = self.db.backend(),
            tables = tables.len(),
            "schema snapshot built"
        );
        Ok(SchemaSnapshot::new(tables))
    }

    async fn sample_rows_block(&self, table: &str) -> Option<String> {
        let limit = self.options.sample_rows;
        let sql = format!("SELECT * FROM {} LIMIT {limit}", quote_identifier(table));
        let set = match self.db.fetch_rows(&sql, limit).await {
            Ok(set) => set,
            Err(err) => {
                tracing::debug!(table, error = %err, "skipping sample rows");
                return None;
            }
        };

        let mut out = format!("/*\n{limit} rows from {table} table:\n");
        out.push_str(&set.columns.join("\t"));
        for row in &set.rows {
            out.push('\n');
            let cells: Vec<String> = set
                .columns
                .iter()
                .map(|c| {
                    let cell = row.get(c).map(value_to_cell).unwrap_or_default();
                    truncate_chars(&cell, MAX_SAMPLE_CELL_CHARS)
                })
                .collect();
            out.push_str(&cells.join("\t"));
        }
        out.push_str("\n*/");
        Some(out)
    }
}

fn create_table_block(table: &str, columns: &[ColumnInfo]) -> String {
    let body = columns
        .iter()
        .map(|c| {
            let not_null = if c.nullable == Some(false) { " NOT NULL" } else { "" };
            format!("\t{} {}{not_null}", c.name, c.data_type)
        })
        .collect::<Vec<_>>()
        .join(",\n");
    format!("CREATE TABLE {table} (\n{body}\n)")
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
