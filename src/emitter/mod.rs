// ABOUTME: Change classifier and CSV emitter
// ABOUTME: Filters records by enabled category and appends rows in decode order

mod rows;

pub use rows::{entity_row, member_rows, tag_rows};

use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crate::config::{Category, EmitConfig};
use crate::osc::{ChangeRecord, ElementType};

/// Row counts for one or more emitted diffs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmitStats {
    pub records: u64,
    pub nodes: u64,
    pub ways: u64,
    pub relations: u64,
    pub members: u64,
    pub tags: u64,
    /// Highest changeset id among emitted records
    pub max_changeset: Option<u64>,
}

impl EmitStats {
    pub fn rows(&self) -> u64 {
        self.nodes + self.ways + self.relations + self.members + self.tags
    }

    pub fn rows_for(&self, category: Category) -> u64 {
        match category {
            Category::Nodes => self.nodes,
            Category::Ways => self.ways,
            Category::Relations => self.relations,
            Category::Members => self.members,
            Category::Tags => self.tags,
        }
    }

    fn count(&mut self, category: Category, rows: u64) {
        match category {
            Category::Nodes => self.nodes += rows,
            Category::Ways => self.ways += rows,
            Category::Relations => self.relations += rows,
            Category::Members => self.members += rows,
            Category::Tags => self.tags += rows,
        }
    }

    pub fn merge(&mut self, other: &EmitStats) {
        self.records += other.records;
        for category in Category::ALL {
            self.count(category, other.rows_for(category));
        }
        self.max_changeset = self.max_changeset.max(other.max_changeset);
    }
}

/// Writes CSV rows for enabled categories to an output stream.
///
/// A header precedes the first row of each category. Rows of different
/// categories interleave in decode order; the leading `kind` column tells
/// them apart.
///
/// Rows for a diff are rendered in memory first. The output itself is a
/// blocking `Write` that is only touched from the blocking thread pool, so a
/// stalled reader never holds up the async runtime and the write can be
/// abandoned on shutdown.
pub struct RowEmitter<W> {
    output: Arc<Mutex<W>>,
    config: EmitConfig,
    headers_written: HashSet<Category>,
}

impl<W: Write + Send + 'static> RowEmitter<W> {
    pub fn new(output: W, config: EmitConfig) -> Self {
        Self {
            output: Arc::new(Mutex::new(output)),
            config,
            headers_written: HashSet::new(),
        }
    }

    /// Render all rows of one diff without touching the output.
    pub fn render_diff<'a, I>(&mut self, records: I) -> io::Result<(Vec<u8>, EmitStats)>
    where
        I: IntoIterator<Item = &'a ChangeRecord>,
    {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_writer(Vec::new());
        let mut stats = EmitStats::default();
        for record in records {
            self.render(&mut writer, record, &mut stats)?;
        }
        let rows = writer
            .into_inner()
            .map_err(|e| io::Error::new(e.error().kind(), e.error().to_string()))?;
        Ok((rows, stats))
    }

    /// Append rendered rows to the output and flush it.
    ///
    /// Runs on the blocking pool. Dropping the returned future stops waiting
    /// but does not stop a write already in progress.
    pub async fn write(&self, rows: Vec<u8>) -> io::Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let output = Arc::clone(&self.output);
        tokio::task::spawn_blocking(move || {
            let mut output = output
                .lock()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "output lock poisoned"))?;
            output.write_all(&rows)?;
            output.flush()
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    /// Render and write all records of one diff.
    pub async fn emit_diff<'a, I>(&mut self, records: I) -> io::Result<EmitStats>
    where
        I: IntoIterator<Item = &'a ChangeRecord>,
    {
        let (rows, stats) = self.render_diff(records)?;
        self.write(rows).await?;
        Ok(stats)
    }

    /// Take the output back. Fails while an abandoned write still holds it.
    pub fn into_inner(self) -> io::Result<W> {
        let output = Arc::try_unwrap(self.output).map_err(|_| {
            io::Error::new(io::ErrorKind::WouldBlock, "output is still held by a pending write")
        })?;
        output
            .into_inner()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "output lock poisoned"))
    }

    /// Every row a record produces under the active configuration.
    ///
    /// Order: entity row, then member rows, then tag rows sorted by key.
    fn render(
        &mut self,
        writer: &mut csv::Writer<Vec<u8>>,
        record: &ChangeRecord,
        stats: &mut EmitStats,
    ) -> io::Result<()> {
        stats.records += 1;
        stats.max_changeset = stats.max_changeset.max(record.changeset);

        let category = match record.element_type() {
            ElementType::Node => Category::Nodes,
            ElementType::Way => Category::Ways,
            ElementType::Relation => Category::Relations,
        };
        if self.config.is_enabled(category) {
            self.write_rows(writer, category, std::iter::once(entity_row(record)), stats)?;
        }
        if self.config.is_enabled(Category::Members) {
            self.write_rows(writer, Category::Members, member_rows(record), stats)?;
        }
        if self.config.is_enabled(Category::Tags) {
            self.write_rows(writer, Category::Tags, tag_rows(record), stats)?;
        }
        Ok(())
    }

    fn write_rows<I>(
        &mut self,
        writer: &mut csv::Writer<Vec<u8>>,
        category: Category,
        rows: I,
        stats: &mut EmitStats,
    ) -> io::Result<()>
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        for row in rows {
            if self.headers_written.insert(category) {
                writer.write_record(category.header())?;
            }
            writer.write_record(&row)?;
            stats.count(category, 1);
        }
        Ok(())
    }
}
