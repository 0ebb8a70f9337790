use std::collections::VecDeque;

use rusqlite::types::Value;
use rusqlite::{Connection, params_from_iter};

use super::Queue;
use super::jobs::{JOB_COLUMNS, job_from_row};
use crate::error::QueueError;
use crate::state_machine::{Job, JobId, JobState};

const PAGE_SIZE: usize = 256;

/// Equality predicates over job records, AND-combined.
///
/// Tombstones only show up when asked for, either through
/// `include_deleted` or an explicit `state=deleted`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub tag: Option<String>,
    pub id: Option<JobId>,
    pub include_deleted: bool,
}

impl JobFilter {
    pub fn state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// Parse `key=value` terms such as `state=pending tag=nightly`.
    ///
    /// Each argument may itself hold several whitespace-separated terms.
    /// Known keys are `state`, `tag` and `id` (alias `jid`).
    pub fn parse<S: AsRef<str>>(terms: &[S]) -> Result<Self, QueueError> {
        let mut filter = Self::default();
        for term in terms.iter().flat_map(|t| t.as_ref().split_whitespace()) {
            let (key, value) = term.split_once('=').ok_or_else(|| {
                QueueError::InvalidArgument(format!("expected key=value, got `{term}`"))
            })?;
            let value = value.trim();
            if value.is_empty() {
                return Err(QueueError::InvalidArgument(format!(
                    "empty value for `{key}`"
                )));
            }

            match key.trim().to_ascii_lowercase().as_str() {
                "state" => set_once(&mut filter.state, value.parse()?, "state")?,
                "tag" => set_once(&mut filter.tag, value.to_string(), "tag")?,
                "id" | "jid" => {
                    let id = value.parse::<JobId>().map_err(|_| {
                        QueueError::InvalidArgument(format!("invalid job id `{value}`"))
                    })?;
                    set_once(&mut filter.id, id, "id")?;
                }
                other => {
                    return Err(QueueError::InvalidArgument(format!(
                        "unknown filter key `{other}`"
                    )));
                }
            }
        }
        Ok(filter)
    }

    fn where_clause(&self) -> (String, Vec<Value>) {
        let mut terms = Vec::new();
        let mut values = Vec::new();

        match self.state {
            Some(state) => {
                terms.push("state = ?");
                values.push(Value::Text(state.as_str().to_string()));
            }
            None if !self.include_deleted => terms.push("state <> 'deleted'"),
            None => {}
        }
        if let Some(tag) = &self.tag {
            terms.push("tag = ?");
            values.push(Value::Text(tag.clone()));
        }
        if let Some(id) = self.id {
            terms.push("id = ?");
            values.push(Value::Integer(id));
        }
        terms.push("id > ?");

        (terms.join(" AND "), values)
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, key: &str) -> Result<(), QueueError> {
    if slot.is_some() {
        return Err(QueueError::InvalidArgument(format!(
            "filter key `{key}` given twice"
        )));
    }
    *slot = Some(value);
    Ok(())
}

/// Lazy walk over matching jobs in id order, fetched a page at a time.
pub struct JobCursor<'q> {
    conn: &'q Connection,
    filter: JobFilter,
    page_size: usize,
    after: JobId,
    buffer: VecDeque<Job>,
    exhausted: bool,
}

impl JobCursor<'_> {
    fn fill(&mut self) -> Result<(), QueueError> {
        let (clause, mut values) = self.filter.where_clause();
        values.push(Value::Integer(self.after));
        values.push(Value::Integer(self.page_size as i64));

        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE {clause} ORDER BY id LIMIT ?");
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let page = stmt
            .query_map(params_from_iter(values.iter()), job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.after = last.id;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for JobCursor<'_> {
    type Item = Result<Job, QueueError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

impl Queue {
    /// Jobs matching `filter`, oldest first. Each call starts a fresh walk.
    pub fn list(&self, filter: JobFilter) -> JobCursor<'_> {
        self.list_paged(filter, PAGE_SIZE)
    }

    pub(crate) fn list_paged(&self, filter: JobFilter, page_size: usize) -> JobCursor<'_> {
        JobCursor {
            conn: &self.conn,
            filter,
            page_size: page_size.max(1),
            after: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }
}
